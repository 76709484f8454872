use thiserror::Error;

use crate::source::SourceError;

/// Startup failures. All of these are fatal: the process reports the
/// reason once and exits without ever serving the protocol.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The companion container runtime is not installed.
    #[error("could not find {0} on this machine")]
    RuntimeNotFound(String),

    /// The graphic driver is missing or the management library cannot
    /// be loaded.
    #[error("unable to load: check libnvidia-ml.so.1 library and graphic drivers")]
    UnableToLoad(#[source] SourceError),

    /// Enumeration worked but came back empty.
    #[error("GPUs are not found on this host")]
    NoGpus,

    /// Enumeration failed partway through.
    #[error("could not get available devices")]
    Enumeration(#[source] SourceError),
}
