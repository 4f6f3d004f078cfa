use std::collections::HashMap;

use crate::macaddress::MacAddress;

/// Sentinel RSSI value used whenever a real reading isn't available.
pub const NO_RSSI: i16 = -127;

/// Where a [`BleDevice`] came from, and the path-shaped handle needed to act on it further.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceDetails {
    /// Discovered through a BlueZ D-Bus object, reachable through a specific adapter.
    BlueZ {
        /// The full device object path, e.g. `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`.
        path: String,
        /// The adapter id extracted from `path`, e.g. `hci0`.
        adapter: String,
    },
    /// Discovered through some other bridge/proxy that isn't modelled as a BlueZ path.
    RemoteProxy {
        /// An opaque identifier for the bridge that reported this device.
        source: String,
    },
    /// No further detail is available; the address is all we have.
    Unknown,
}

/// A read-only, immutable snapshot of a Bluetooth device, as it appeared at the moment it was
/// produced. A fresh one is derived before every connection attempt; nothing mutates a
/// `BleDevice` in place.
#[derive(Clone, Debug, PartialEq)]
pub struct BleDevice {
    pub address: MacAddress,
    pub name: Option<String>,
    pub details: DeviceDetails,
    pub rssi: i16,
    pub services: Vec<String>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl BleDevice {
    /// Build a minimal device with no platform details, e.g. as a caller-supplied starting point
    /// before the first [`crate::arbiter::Arbiter::freshen`] call.
    pub fn new(address: MacAddress) -> Self {
        BleDevice {
            address,
            name: None,
            details: DeviceDetails::Unknown,
            rssi: NO_RSSI,
            services: Vec::new(),
            manufacturer_data: HashMap::new(),
        }
    }

    /// The BlueZ object path, if this device was derived from one.
    pub fn path(&self) -> Option<&str> {
        match &self.details {
            DeviceDetails::BlueZ { path, .. } => Some(path),
            _ => None,
        }
    }

    /// The adapter id, if this device was derived from a BlueZ path.
    pub fn adapter(&self) -> Option<&str> {
        match &self.details {
            DeviceDetails::BlueZ { adapter, .. } => Some(adapter),
            _ => None,
        }
    }

    /// Whether `self` and `other` refer to the same address reachable through the same path.
    /// Used by the retry engine to decide whether a new client needs to be constructed.
    pub fn has_changed_from(&self, other: &BleDevice) -> bool {
        self.address != other.address || self.path() != other.path()
    }

    /// A human-readable description suitable for log messages and terminal error text:
    /// `"<address> - <name>"`, or just `"<address>"` if the name is unknown or identical to it,
    /// followed by `" -> <path-prefix>"` / `" -> <source>"` when platform details are known.
    pub fn description(&self) -> String {
        let base = match &self.name {
            Some(name) if name != &self.address.to_string() => {
                format!("{} - {}", self.address, name)
            }
            _ => self.address.to_string(),
        };
        match &self.details {
            DeviceDetails::BlueZ { adapter, .. } => format!("{} -> /org/bluez/{}", base, adapter),
            DeviceDetails::RemoteProxy { source } => format!("{} -> {}", base, source),
            DeviceDetails::Unknown => base,
        }
    }
}
