//! Discovers v4l2loopback video devices from sysfs.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::DeviceRecord;
use crate::error::DevicePluginError;

/// Default sysfs directory listing virtual video4linux devices.
pub const DEFAULT_SYSFS_DIR: &str = "/sys/devices/virtual/video4linux";
/// Default directory holding the device nodes.
pub const DEFAULT_DEV_DIR: &str = "/dev";

const DEVICE_PREFIX: &str = "video";

/// Scans the host for virtual video devices.
#[derive(Debug, Clone)]
pub struct DeviceEnumerator {
    sysfs_dir: PathBuf,
    dev_dir: PathBuf,
}

impl Default for DeviceEnumerator {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_DIR, DEFAULT_DEV_DIR)
    }
}

impl DeviceEnumerator {
    pub fn new<P1: Into<PathBuf>, P2: Into<PathBuf>>(sysfs_dir: P1, dev_dir: P2) -> Self {
        Self {
            sysfs_dir: sysfs_dir.into(),
            dev_dir: dev_dir.into(),
        }
    }

    /// List the devices currently present, ordered by device number.
    ///
    /// A missing sysfs directory means the loopback module is not loaded and
    /// yields an empty list. Entries that cannot be read are skipped.
    pub fn enumerate(&self) -> Result<Vec<DeviceRecord>, Report<DevicePluginError>> {
        let entries = match fs::read_dir(&self.sysfs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "sysfs directory {} does not exist, no devices to advertise",
                    self.sysfs_dir.display()
                );
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(Report::new(e)
                    .change_context(DevicePluginError::Enumeration {
                        message: format!("cannot read {}", self.sysfs_dir.display()),
                    }));
            }
        };

        let mut devices = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("skipping unreadable sysfs entry: {e}");
                    continue;
                }
            };
            if let Some(device) = self.probe(&entry.file_name()) {
                devices.push(device);
            }
        }

        devices.sort_by(|a, b| {
            device_number(&a.id)
                .cmp(&device_number(&b.id))
                .then_with(|| a.id.cmp(&b.id))
        });

        info!("found {} video devices", devices.len());
        Ok(devices)
    }

    /// Turn one sysfs entry into a device record, or skip it.
    fn probe(&self, file_name: &std::ffi::OsStr) -> Option<DeviceRecord> {
        let Some(name) = file_name.to_str() else {
            warn!("skipping sysfs entry with non UTF-8 name: {file_name:?}");
            return None;
        };

        if device_number(name).is_none() {
            debug!("skipping sysfs entry {name}: not a video device");
            return None;
        }

        let path = self.dev_dir.join(name);
        if !path.exists() {
            warn!("skipping {name}: device node {} is missing", path.display());
            return None;
        }

        let label = read_label(&self.sysfs_dir.join(name));
        debug!(
            "discovered device {name} at {} ({})",
            path.display(),
            label.as_deref().unwrap_or("no label")
        );

        Some(DeviceRecord::new(name, path))
    }
}

/// Number of a `video<N>` name, `None` for any other name.
fn device_number(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(DEVICE_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Card label reported by the driver, if readable.
fn read_label(device_dir: &Path) -> Option<String> {
    fs::read_to_string(device_dir.join("name"))
        .ok()
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
}
