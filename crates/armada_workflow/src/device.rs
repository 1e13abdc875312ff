//! Devices and device pools.
//!
//! A [`Device`] is the unit a service step is applied to. Devices are grouped
//! into named [`Pool`]s which services may reference as a target source.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unique identifier for a device in the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u64);

impl DeviceId {
    /// Creates a new device ID.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device_{}", self.0)
    }
}

/// A network device that services run against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Unique identifier.
    pub id: DeviceId,
    /// Human-readable name, unique across the inventory.
    pub name: String,
    /// Management address used by connection drivers.
    pub address: String,
    /// Default connection driver kind for this device (e.g. `"ssh"`).
    pub driver: String,
    /// Free-form properties exposed to expressions as `device.<key>`.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Device {
    /// Creates a device with no extra properties.
    #[must_use]
    pub fn new(
        id: u64,
        name: impl Into<String>,
        address: impl Into<String>,
        driver: impl Into<String>,
    ) -> Self {
        Self {
            id: DeviceId(id),
            name: name.into(),
            address: address.into(),
            driver: driver.into(),
            properties: Map::new(),
        }
    }

    /// Adds a property and returns self for chaining.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Returns the device as a JSON object, as seen by expressions.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = self.properties.clone();
        object.insert("id".into(), Value::from(self.id.0));
        object.insert("name".into(), Value::from(self.name.clone()));
        object.insert("address".into(), Value::from(self.address.clone()));
        object.insert("driver".into(), Value::from(self.driver.clone()));
        Value::Object(object)
    }
}

/// A named group of devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Pool name, referenced by [`TargetConfig::pools`](crate::policy::TargetConfig::pools).
    pub name: String,
    /// Member devices.
    pub devices: Vec<DeviceId>,
}

impl Pool {
    /// Creates a pool.
    #[must_use]
    pub fn new(name: impl Into<String>, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        Self {
            name: name.into(),
            devices: devices.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_display() {
        assert_eq!(DeviceId::new(7).to_string(), "device_7");
    }

    #[test]
    fn device_value_exposes_properties_and_identity() {
        let device = Device::new(1, "edge-1", "10.0.0.1", "ssh").with_property("vendor", "acme");
        let value = device.to_value();
        assert_eq!(value["name"], "edge-1");
        assert_eq!(value["vendor"], "acme");
        assert_eq!(value["id"], 1);
    }
}
