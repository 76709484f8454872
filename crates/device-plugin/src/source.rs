use std::collections::HashSet;
use std::ffi::OsStr;
use std::time::Duration;

use nvml_wrapper::bitmasks::event::EventTypes;
use nvml_wrapper::enums::event::XidError;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::registry::DeviceInfo;

/// Errors from the underlying hardware monitoring library.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("NVML call failed: {0}")]
    Nvml(#[from] NvmlError),
}

/// How long one event wait may block before the watch loop rechecks
/// the shutdown signal. Bounds how late a cancellation is observed.
const EVENT_WAIT: Duration = Duration::from_secs(1);

/// XIDs raised by the application running on the GPU rather than by
/// the hardware; they say nothing about device health.
const APPLICATION_XIDS: [u64; 5] = [13, 31, 43, 45, 68];

/// Access to the physical devices and their failure events.
///
/// Implementations are handed over already initialized; a failed
/// initialization is the fatal "unable to load" startup condition.
pub trait DeviceSource: Send + Sync {
    /// Version of the installed graphic driver.
    fn driver_version(&self) -> Result<String, SourceError>;

    /// Every physical device visible to the driver.
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, SourceError>;

    /// Blocks watching for device failures until `token` is
    /// cancelled, emitting the id of every device observed to fail.
    /// Must never emit an id outside `ids` and must return within
    /// bounded time after cancellation. Duplicate emissions for the
    /// same device are allowed; the consumer applies them
    /// idempotently.
    fn watch_health(
        &self,
        ids: &HashSet<String>,
        token: &CancellationToken,
        events: &broadcast::Sender<String>,
    ) -> Result<(), SourceError>;

    /// Releases the monitoring subsystem. Called exactly once, after
    /// the shutdown signal is cancelled.
    fn shutdown(&self) -> Result<(), SourceError>;
}

/// NVML-backed device source.
pub struct NvmlDeviceSource {
    nvml: Nvml,
}

impl NvmlDeviceSource {
    /// Loads NVML, retrying with the explicit library name when the
    /// default lookup fails. Containers often only ship
    /// libnvidia-ml.so.1 without the unversioned symlink.
    pub fn load() -> Result<Self, SourceError> {
        let nvml = match Nvml::init() {
            Ok(nvml) => nvml,
            Err(e) => {
                warn!("standard NVML init failed ({e}), retrying with explicit library path");
                Nvml::builder()
                    .lib_path(OsStr::new("libnvidia-ml.so.1"))
                    .init()?
            }
        };
        info!("NVML loaded");
        Ok(Self { nvml })
    }
}

impl DeviceSource for NvmlDeviceSource {
    fn driver_version(&self) -> Result<String, SourceError> {
        Ok(self.nvml.sys_driver_version()?)
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, SourceError> {
        let count = self.nvml.device_count()?;
        let mut devices = Vec::with_capacity(count as usize);
        for i in 0..count {
            let device = self.nvml.device_by_index(i)?;
            let id = device.uuid()?;
            let minor = device.minor_number()?;
            info!("found GPU {i}: {id} ({})", device.name()?);
            devices.push(DeviceInfo {
                id,
                host_path: format!("/dev/nvidia{minor}"),
            });
        }
        Ok(devices)
    }

    fn watch_health(
        &self,
        ids: &HashSet<String>,
        token: &CancellationToken,
        events: &broadcast::Sender<String>,
    ) -> Result<(), SourceError> {
        let mut set = self.nvml.create_event_set()?;
        for id in ids {
            let device = self.nvml.device_by_uuid(id.as_str())?;
            // A failed registration frees the set, so unsupported
            // devices are screened out before registering.
            let supported = match device.supported_event_types() {
                Ok(types) => types,
                Err(NvmlError::NotSupported) => EventTypes::empty(),
                Err(e) => return Err(e.into()),
            };
            if !supported.contains(EventTypes::CRITICAL_XID_ERROR) {
                warn!("device {id} does not support health events, leaving it unmonitored");
                continue;
            }
            set = device
                .register_events(EventTypes::CRITICAL_XID_ERROR, set)
                .map_err(|e| SourceError::from(e.error))?;
        }

        loop {
            if token.is_cancelled() {
                info!("GPU health watch cancelled");
                return Ok(());
            }
            let data = match set.wait(EVENT_WAIT.as_millis() as u32) {
                Ok(data) => data,
                Err(NvmlError::Timeout) => continue,
                Err(e) => return Err(e.into()),
            };
            let Some(xid) = data.event_data else {
                continue;
            };
            if !is_device_failure(&xid) {
                debug!("ignoring application XID: {xid:?}");
                continue;
            }
            let id = data.device.uuid()?;
            if !ids.contains(&id) {
                continue;
            }
            warn!("device {id} raised a critical XID: {xid:?}");
            // No receivers is fine: during shutdown the consumers may
            // already be gone.
            let _ = events.send(id);
        }
    }

    fn shutdown(&self) -> Result<(), SourceError> {
        // NVML itself shuts down when the last handle drops.
        info!("releasing GPU monitoring");
        Ok(())
    }
}

/// Whether an XID indicates a failing device. Application XIDs say
/// nothing about the hardware; an XID the driver cannot identify is
/// treated as a real failure rather than skipped.
fn is_device_failure(xid: &XidError) -> bool {
    match xid {
        XidError::Value(code) => !APPLICATION_XIDS.contains(code),
        XidError::Unknown => true,
    }
}
