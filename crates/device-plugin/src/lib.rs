//! Kubelet device plugin advertising v4l2loopback video devices.

pub mod api;
pub mod config;
pub mod device;
pub mod error;
pub mod kubelet_watcher;
pub mod plugin;

pub use error::DevicePluginError;
