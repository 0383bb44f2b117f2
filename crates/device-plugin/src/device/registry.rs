use std::collections::HashMap;

use tracing::debug;
use tracing::warn;

use crate::api;
use crate::device::AdvertisedDevice;
use crate::device::DeviceRecord;
use crate::device::Health;
use crate::error::DevicePluginError;

/// Immutable snapshot of the devices managed by this plugin.
///
/// The lookup map and the advertised list are built from a single pass over
/// the enumerated records and never change afterwards.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    records: HashMap<String, DeviceRecord>,
    advertised: Vec<AdvertisedDevice>,
}

impl DeviceRegistry {
    pub fn new<I: IntoIterator<Item = DeviceRecord>>(records: I) -> Self {
        let mut registry = Self::default();
        for record in records {
            if registry.records.contains_key(&record.id) {
                warn!("ignoring duplicate device identity {}", record.id);
                continue;
            }
            registry.advertised.push(AdvertisedDevice {
                id: record.id.clone(),
                health: Health::Healthy,
            });
            registry.records.insert(record.id.clone(), record);
        }
        registry
    }

    pub fn get(&self, id: &str) -> Option<&DeviceRecord> {
        self.records.get(id)
    }

    /// Devices in enumeration order.
    pub fn advertised(&self) -> &[AdvertisedDevice] {
        &self.advertised
    }

    pub fn len(&self) -> usize {
        self.advertised.len()
    }

    pub fn is_empty(&self) -> bool {
        self.advertised.is_empty()
    }

    /// Payload for the ListAndWatch stream.
    pub fn list_response(&self) -> api::ListAndWatchResponse {
        api::ListAndWatchResponse {
            devices: self.advertised.iter().map(api::Device::from).collect(),
        }
    }

    /// Resolve the requested identities to device specs, in request order.
    pub fn device_specs<S: AsRef<str>>(
        &self,
        ids: &[S],
    ) -> Result<Vec<api::DeviceSpec>, DevicePluginError> {
        ids.iter()
            .map(|id| {
                let id = id.as_ref();
                debug!("resolving device {id}");
                self.get(id)
                    .map(DeviceRecord::device_spec)
                    .ok_or_else(|| DevicePluginError::UnknownDevice(id.to_string()))
            })
            .collect()
    }
}
