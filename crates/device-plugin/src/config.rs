use std::path::PathBuf;

use clap::Parser;

/// Node-local GPU device plugin for Kubernetes.
#[derive(Debug, Parser)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Directory holding the accelerator library list (nvliblist.conf).
    #[arg(long, env = "PLUGIN_CONF_DIR", default_value = "/etc/gpu-device-plugin")]
    pub conf_dir: PathBuf,

    /// Directory where the kubelet watches for plugin sockets.
    #[arg(long, env = "PLUGIN_SOCKET_DIR", default_value = device_plugin_pb::DEVICE_PLUGIN_DIR)]
    pub socket_dir: PathBuf,

    /// Socket file name this plugin listens on inside the socket dir.
    #[arg(long, env = "PLUGIN_ENDPOINT", default_value = "gpu-device-plugin.sock")]
    pub endpoint: String,

    /// Extended resource name advertised to the kubelet.
    #[arg(long, env = "PLUGIN_RESOURCE_NAME", default_value = "nvidia.com/gpu")]
    pub resource_name: String,

    /// Companion container runtime binary that must be reachable on
    /// PATH before the plugin starts.
    #[arg(long, env = "PLUGIN_RUNTIME_BINARY", default_value = "runc")]
    pub runtime_binary: String,

    /// Kubelet registration socket. Defaults to kubelet.sock inside
    /// the socket dir.
    #[arg(long, env = "PLUGIN_KUBELET_SOCKET")]
    pub kubelet_socket: Option<PathBuf>,
}

impl Args {
    /// Full path of the socket this plugin serves on.
    pub fn plugin_socket(&self) -> PathBuf {
        self.socket_dir.join(&self.endpoint)
    }

    /// Full path of the kubelet registration socket.
    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.kubelet_socket
            .clone()
            .unwrap_or_else(|| self.socket_dir.join(device_plugin_pb::KUBELET_SOCKET))
    }
}
