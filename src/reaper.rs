//! Disconnects stale, concurrently connected instances of a target device across adapters before
//! a new connection attempt begins.
//!
//! Grounded on `close_stale_connections`/`get_connected_devices` in
//! `bleak_retry_connector/__init__.py` and the D-Bus `Disconnect` call pattern in
//! `bleak_retry_connector/dbus.py`, translated to `dbus::nonblock::Proxy` the way
//! `bluez-async::BluetoothSession::disconnect` issues the same call.

use std::sync::Arc;
use std::time::Duration;

use dbus::nonblock::Proxy;
use dbus::nonblock::SyncConnection;

use crate::device::BleDevice;
use crate::path::sibling_paths;
use crate::view::DeviceView;

/// Per-disconnect timeout; a failure (including a timeout) is suppressed so one stuck peer can't
/// abort the outer reap.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const DEVICE_INTERFACE: &str = "org.bluez.Device1";

/// Enumerates and disconnects stale connected instances of a target device.
pub struct StaleReaper {
    view: Arc<dyn DeviceView>,
    connection: Arc<SyncConnection>,
}

impl StaleReaper {
    pub fn new(view: Arc<dyn DeviceView>, connection: Arc<SyncConnection>) -> Self {
        StaleReaper { view, connection }
    }

    /// Disconnect other connected instances of `device`'s address.
    ///
    /// `only_other_adapters = true` disconnects only instances whose path differs from
    /// `device`'s; `false` disconnects every connected instance, including `device`'s own path.
    pub async fn close_stale_connections(&self, device: &BleDevice, only_other_adapters: bool) {
        let connected = self.get_connected_devices(device).await;
        if connected.is_empty() {
            return;
        }

        let mut to_disconnect = Vec::new();
        for candidate in connected {
            let is_target_path = candidate.path() == device.path();
            if only_other_adapters && is_target_path {
                log::debug!(
                    "{} - {}: unexpectedly connected, not disconnecting since only_other_adapters is set",
                    candidate.address,
                    candidate.path().unwrap_or_default()
                );
                continue;
            }
            log::debug!(
                "{} - {}: unexpectedly connected, disconnecting",
                candidate.address,
                candidate.path().unwrap_or_default()
            );
            to_disconnect.push(candidate);
        }

        if to_disconnect.is_empty() {
            return;
        }
        self.disconnect_devices(&to_disconnect).await;
    }

    async fn get_connected_devices(&self, device: &BleDevice) -> Vec<BleDevice> {
        let Some(path) = device.path() else {
            return Vec::new();
        };
        let Ok(properties) = self.view.get_properties().await else {
            return Vec::new();
        };

        let mut connected = Vec::new();
        for sibling in sibling_paths(path) {
            let Some(props) = properties
                .get(&sibling)
                .and_then(|ifaces| ifaces.get(DEVICE_INTERFACE))
            else {
                continue;
            };
            let is_connected = props
                .get("Connected")
                .and_then(|v| dbus::arg::RefArg::as_u64(&v.0))
                .map(|v| v != 0)
                .unwrap_or(false);
            if is_connected {
                connected.push(crate::arbiter::device_from_properties(&sibling, props));
            }
        }
        connected
    }

    async fn disconnect_devices(&self, devices: &[BleDevice]) {
        for device in devices {
            let Some(path) = device.path() else { continue };
            let proxy = Proxy::new("org.bluez", path.to_owned(), DISCONNECT_TIMEOUT, self.connection.clone());
            let result: Result<(), dbus::Error> = proxy.method_call(DEVICE_INTERFACE, "Disconnect", ()).await;
            if let Err(error) = result {
                log::debug!("{} - {}: failed to disconnect stale connection: {}", device.address, path, error);
            }
        }
    }
}

/// Thin shortcut: derive `address`'s own-adapter device via the arbiter, then close stale
/// connections for it.
pub async fn close_stale_connections_by_address(
    reaper: &StaleReaper,
    arbiter: &crate::arbiter::Arbiter,
    address: crate::macaddress::MacAddress,
    adapter: &str,
    only_other_adapters: bool,
) {
    if let Some(device) = arbiter.get_device_by_adapter(address, adapter).await {
        reaper.close_stale_connections(&device, only_other_adapters).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_timeout_matches_documented_default() {
        assert_eq!(DISCONNECT_TIMEOUT, Duration::from_secs(5));
    }
}
