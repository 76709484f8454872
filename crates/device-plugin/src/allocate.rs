//! Pure translation of allocation requests into mount and device-spec
//! instructions. Nothing here mutates the registry; it is safe to run
//! concurrently with the watch streams.

use std::collections::HashMap;

use device_plugin_pb::api::ContainerAllocateResponse;
use device_plugin_pb::api::DeviceSpec;
use device_plugin_pb::api::Mount;
use thiserror::Error;

use crate::registry::DeviceRegistry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocateError {
    /// A container asked for a device id the registry has never seen.
    #[error("device {0} is not known on this host")]
    UnknownDevice(String),
}

/// Builds the mount list shared by every container in one allocate
/// call: each accelerator library and binary is bind-mounted read-only
/// at its host path. No path remapping is performed.
pub fn build_mounts(lib_paths: &[String], bin_paths: &[String]) -> Vec<Mount> {
    lib_paths
        .iter()
        .chain(bin_paths.iter())
        .map(|path| Mount {
            container_path: path.clone(),
            host_path: path.clone(),
            read_only: true,
        })
        .collect()
}

/// Builds one container's device-spec list: the complementary control
/// nodes first, then the device node of every requested id in request
/// order.
pub fn container_devices(
    registry: &DeviceRegistry,
    complementary: &[String],
    requested_ids: &[String],
) -> Result<Vec<DeviceSpec>, AllocateError> {
    let mut devices = Vec::with_capacity(complementary.len() + requested_ids.len());
    for path in complementary {
        devices.push(device_spec(path));
    }
    for id in requested_ids {
        let host_path = registry
            .host_path(id)
            .ok_or_else(|| AllocateError::UnknownDevice(id.clone()))?;
        devices.push(device_spec(host_path));
    }
    Ok(devices)
}

/// Full response for one container request.
pub fn container_response(
    registry: &DeviceRegistry,
    mounts: &[Mount],
    complementary: &[String],
    requested_ids: &[String],
) -> Result<ContainerAllocateResponse, AllocateError> {
    Ok(ContainerAllocateResponse {
        envs: HashMap::new(),
        mounts: mounts.to_vec(),
        devices: container_devices(registry, complementary, requested_ids)?,
        annotations: HashMap::new(),
        cdi_devices: Vec::new(),
    })
}

fn device_spec(path: &str) -> DeviceSpec {
    DeviceSpec {
        container_path: path.to_string(),
        host_path: path.to_string(),
        permissions: "rw".to_string(),
    }
}
