//! Generated bindings for the kubelet device plugin API (v1beta1).

pub mod api {
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("v1beta1");
}

/// API version reported to the kubelet on registration.
pub const VERSION: &str = "v1beta1";

/// Health value for a device that is fully operational.
pub const HEALTHY: &str = "Healthy";

/// Health value for a device that should not be scheduled onto.
pub const UNHEALTHY: &str = "Unhealthy";

/// Directory where the kubelet expects device plugin sockets.
pub const DEVICE_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";

/// Name of the kubelet registration socket inside [`DEVICE_PLUGIN_DIR`].
pub const KUBELET_SOCKET: &str = "kubelet.sock";
