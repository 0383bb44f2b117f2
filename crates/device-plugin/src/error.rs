use thiserror::Error;
use tonic::Status;

use crate::plugin::lifecycle::Phase;

/// Errors that can occur while discovering devices or running the plugin.
#[derive(Debug, Error)]
pub enum DevicePluginError {
    #[error("Failed to enumerate devices: {message}")]
    Enumeration { message: String },
    #[error("Failed to bind device plugin socket {path}")]
    SocketBind { path: String },
    #[error("Failed to remove device plugin socket {path}")]
    SocketCleanup { path: String },
    #[error("Device plugin server is not reachable at {path}")]
    ServerUnreachable { path: String },
    #[error("Failed to register with kubelet at {endpoint}")]
    Registration { endpoint: String },
    #[error("Failed to watch kubelet socket: {message}")]
    KubeletWatch { message: String },
    #[error("Invalid lifecycle transition: cannot {action} while {phase}")]
    InvalidTransition { action: &'static str, phase: Phase },
    #[error("unknown device identity: {0}")]
    UnknownDevice(String),
}

impl From<DevicePluginError> for Status {
    fn from(err: DevicePluginError) -> Self {
        match err {
            DevicePluginError::UnknownDevice(_) => Status::invalid_argument(err.to_string()),
            other => Status::internal(other.to_string()),
        }
    }
}
