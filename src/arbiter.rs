//! Picks the best adapter path for a device address and detects "already connected elsewhere"
//! conditions.
//!
//! Grounded on `get_bluez_device`/`get_device_by_adapter`/`_get_possible_paths` in
//! `bleak_retry_connector/bluez.py`.

use std::collections::HashMap;
use std::sync::Arc;

use dbus::arg::{PropMap, RefArg};

use crate::device::{BleDevice, DeviceDetails, NO_RSSI};
use crate::macaddress::MacAddress;
use crate::path::{self, sibling_paths};
use crate::view::{manufacturer_data_from_variant, DeviceView};

/// Minimum RSSI margin a sibling path must beat the current best by before the arbiter switches
/// to it. Keeps the arbiter from flapping between two adapters with near-identical signal.
pub const RSSI_SWITCH_THRESHOLD: i16 = 5;

const DEVICE_INTERFACE: &str = "org.bluez.Device1";

/// Picks the best adapter path for an address and detects devices already connected on a
/// different adapter.
pub struct Arbiter {
    view: Arc<dyn DeviceView>,
}

impl Arbiter {
    pub fn new(view: Arc<dyn DeviceView>) -> Self {
        Arbiter { view }
    }

    /// Re-derive the best device handle for `device`'s address, per spec.md §4.C.
    ///
    /// Returns `None` when `device` as given is already the best choice (including when the view
    /// is unavailable, which degrades to a no-op rather than a hard failure). Returns
    /// `Some(better)` when a sibling path should be used instead.
    pub async fn freshen(&self, device: &BleDevice) -> Option<BleDevice> {
        let input_path = device.path()?.to_string();
        let properties = self.view.get_properties().await.ok()?;

        let mut rssi_to_beat = if properties
            .get(&input_path)
            .and_then(|ifaces| ifaces.get(DEVICE_INTERFACE))
            .is_some()
        {
            device.rssi
        } else {
            log::debug!("{} - {}: device has disappeared", device.address, input_path);
            NO_RSSI
        };

        let mut best_path = input_path.clone();
        for sibling in sibling_paths(&input_path) {
            let Some(props) = properties
                .get(&sibling)
                .and_then(|ifaces| ifaces.get(DEVICE_INTERFACE))
            else {
                continue;
            };

            if is_connected(props) {
                log::debug!("{} - {}: device is already connected", device.address, sibling);
                if sibling == input_path {
                    return None;
                }
                return Some(device_from_properties(&sibling, props));
            }

            if sibling == input_path {
                continue;
            }

            let sibling_rssi = rssi(props);
            if rssi_to_beat != NO_RSSI && sibling_rssi - RSSI_SWITCH_THRESHOLD < rssi_to_beat {
                continue;
            }
            best_path = sibling;
            rssi_to_beat = sibling_rssi;
        }

        if best_path == input_path {
            return None;
        }
        let props = properties.get(&best_path)?.get(DEVICE_INTERFACE)?;
        Some(device_from_properties(&best_path, props))
    }

    /// Construct the deterministic path for `address` on `adapter` and return the device there,
    /// without searching sibling paths.
    pub async fn get_device_by_adapter(&self, address: MacAddress, adapter: &str) -> Option<BleDevice> {
        let target = path::address_to_path(address, adapter);
        let properties = self.view.get_properties().await.ok()?;
        let props = properties.get(&target)?.get(DEVICE_INTERFACE)?;
        Some(device_from_properties(&target, props))
    }
}

fn is_connected(props: &PropMap) -> bool {
    props
        .get("Connected")
        .and_then(|v| v.0.as_u64())
        .map(|v| v != 0)
        .unwrap_or(false)
}

fn rssi(props: &PropMap) -> i16 {
    props
        .get("RSSI")
        .and_then(|v| v.0.as_i64())
        .map(|v| v as i16)
        .unwrap_or(NO_RSSI)
}

pub(crate) fn device_from_properties(path: &str, props: &PropMap) -> BleDevice {
    let address = path::address_of(path).unwrap_or_else(|| MacAddress::from([0; 6]));
    let name = props
        .get("Alias")
        .and_then(|v| v.0.as_str())
        .map(str::to_string);
    let services = props
        .get("UUIDs")
        .and_then(|v| v.0.as_iter())
        .map(|iter| {
            iter.filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let manufacturer_data = props
        .get("ManufacturerData")
        .and_then(|v| {
            v.0.as_any()
                .downcast_ref::<HashMap<u16, dbus::arg::Variant<Box<dyn RefArg>>>>()
                .map(manufacturer_data_from_variant)
        })
        .unwrap_or_default();

    BleDevice {
        address,
        name,
        details: DeviceDetails::BlueZ {
            path: path.to_string(),
            adapter: path::adapter_of(path).unwrap_or_default().to_string(),
        },
        rssi: rssi(props),
        services,
        manufacturer_data,
    }
}
