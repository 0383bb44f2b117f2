pub mod enumerator;
pub mod registry;

use std::path::PathBuf;

pub use enumerator::DeviceEnumerator;
pub use registry::DeviceRegistry;

use crate::api;

/// Host side of one virtual video device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// stable identity, e.g. "video0"
    pub id: String,
    /// device node on the host, e.g. "/dev/video0"
    pub path: PathBuf,
}

impl DeviceRecord {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(id: S, path: P) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    /// Device spec handed to the kubelet: same path on both sides, read-write.
    pub fn device_spec(&self) -> api::DeviceSpec {
        let path = self.path.to_string_lossy().into_owned();
        api::DeviceSpec {
            container_path: path.clone(),
            host_path: path,
            permissions: "rw".to_string(),
        }
    }
}

/// Health as reported on the ListAndWatch stream. Loopback devices have no
/// failure signal, so every advertised device is healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Health {
    Healthy,
}

/// Device entry advertised to the kubelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedDevice {
    pub id: String,
    pub health: Health,
}

impl From<&AdvertisedDevice> for api::Device {
    fn from(device: &AdvertisedDevice) -> Self {
        api::Device {
            id: device.id.clone(),
            health: device.health.to_string(),
            topology: None,
        }
    }
}
