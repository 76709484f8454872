//! Node-local GPU device plugin for Kubernetes.
//!
//! Advertises NVIDIA GPUs to the kubelet over the device-plugin
//! v1beta1 API, tracks their health through NVML events, and brokers
//! per-container device assignment at container creation time.

pub mod allocate;
pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod paths;
pub mod plugin;
pub mod registry;
pub mod source;
