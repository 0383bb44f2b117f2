pub mod lifecycle;
pub mod registration;
pub mod service;
pub mod uds;

pub use lifecycle::Phase;
pub use lifecycle::V4l2lDevicePlugin;
pub use service::DevicePluginService;
