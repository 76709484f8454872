use std::collections::HashMap;
use std::collections::HashSet;

use device_plugin_pb::api::Device;
use tracing::warn;

use crate::error::PluginError;

/// Identity of one physical GPU: its stable UUID and the device node
/// it is reachable through on the host. Immutable after enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub host_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => device_plugin_pb::HEALTHY,
            HealthStatus::Unhealthy => device_plugin_pb::UNHEALTHY,
        }
    }
}

/// Authoritative view of every known GPU and its current health.
///
/// The device set is fixed at startup and health only ever moves from
/// `Healthy` to `Unhealthy`. Both maps cover the same key set at all
/// times.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceInfo>,
    health: HashMap<String, HealthStatus>,
}

impl DeviceRegistry {
    /// Builds the registry with every device marked healthy. An empty
    /// enumeration is fatal: a plugin with nothing to advertise must
    /// not start serving.
    pub fn new(devices: Vec<DeviceInfo>) -> Result<Self, PluginError> {
        if devices.is_empty() {
            return Err(PluginError::NoGpus);
        }
        let health = devices
            .iter()
            .map(|dev| (dev.id.clone(), HealthStatus::Healthy))
            .collect();
        let devices = devices.into_iter().map(|dev| (dev.id.clone(), dev)).collect();
        Ok(Self { devices, health })
    }

    /// Marks a device unhealthy. Re-marking is a no-op. An id the
    /// registry has never seen is logged and ignored; the monitor is
    /// seeded from this registry, so that indicates an internal bug
    /// rather than a transient failure.
    pub fn mark_unhealthy(&mut self, id: &str) {
        match self.health.get_mut(id) {
            Some(health) => *health = HealthStatus::Unhealthy,
            None => warn!("health report for unknown device {id}, ignoring"),
        }
    }

    pub fn health(&self, id: &str) -> Option<HealthStatus> {
        self.health.get(id).copied()
    }

    /// Host device node for the given id.
    pub fn host_path(&self, id: &str) -> Option<&str> {
        self.devices.get(id).map(|dev| dev.host_path.as_str())
    }

    pub fn ids(&self) -> HashSet<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Full point-in-time listing of every device and its health,
    /// sorted by id so repeated snapshots of the same state are
    /// identical on the wire.
    pub fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .health
            .iter()
            .map(|(id, health)| Device {
                id: id.clone(),
                health: health.as_str().to_string(),
                topology: None,
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;

    fn two_gpus() -> Vec<DeviceInfo> {
        vec![
            DeviceInfo {
                id: "gpu-0".to_string(),
                host_path: "/dev/nvidia0".to_string(),
            },
            DeviceInfo {
                id: "gpu-1".to_string(),
                host_path: "/dev/nvidia1".to_string(),
            },
        ]
    }

    #[test]
    fn starts_with_every_device_healthy() {
        let registry = DeviceRegistry::new(two_gpus()).unwrap();

        assert_eq!(registry.len(), 2);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        for device in &snapshot {
            assert_eq!(device.health, device_plugin_pb::HEALTHY);
        }
        // device map and health map cover the same ids
        for id in registry.ids() {
            assert!(registry.host_path(&id).is_some());
            assert!(registry.health(&id).is_some());
        }
    }

    #[test]
    fn empty_enumeration_is_fatal() {
        let err = DeviceRegistry::new(Vec::new()).unwrap_err();
        assert!(matches!(err, PluginError::NoGpus));
    }

    #[test]
    fn mark_unhealthy_is_idempotent() {
        let mut registry = DeviceRegistry::new(two_gpus()).unwrap();

        registry.mark_unhealthy("gpu-1");
        let first = registry.snapshot();
        registry.mark_unhealthy("gpu-1");
        let second = registry.snapshot();

        assert_eq!(first, second);
        assert_eq!(registry.health("gpu-1"), Some(HealthStatus::Unhealthy));
        assert_eq!(registry.health("gpu-0"), Some(HealthStatus::Healthy));
    }

    #[test]
    fn unhealthy_set_matches_distinct_notified_ids() {
        let mut registry = DeviceRegistry::new(two_gpus()).unwrap();

        for id in ["gpu-0", "gpu-1", "gpu-0", "gpu-1", "gpu-1"] {
            registry.mark_unhealthy(id);
        }

        for device in registry.snapshot() {
            assert_eq!(device.health, device_plugin_pb::UNHEALTHY);
        }
    }

    #[test]
    fn unknown_id_is_ignored() {
        let mut registry = DeviceRegistry::new(two_gpus()).unwrap();

        registry.mark_unhealthy("gpu-7");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.health("gpu-7"), None);
        for device in registry.snapshot() {
            assert_eq!(device.health, device_plugin_pb::HEALTHY);
        }
    }

    #[test]
    fn snapshot_is_sorted_by_id() {
        let registry = DeviceRegistry::new(two_gpus()).unwrap();
        let ids: Vec<_> = registry.snapshot().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["gpu-0".to_string(), "gpu-1".to_string()]);
    }
}
