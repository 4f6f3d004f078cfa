//! Bounded waits used between retry attempts: waiting out a disconnect, and polling for a device
//! to reappear on the bus.
//!
//! Grounded on `wait_for_disconnect`/`wait_for_device_to_reappear` in
//! `bleak_retry_connector/__init__.py` and `bluez.py`.

use std::time::{Duration, Instant};

use crate::device::BleDevice;
use crate::path::sibling_paths;
use crate::view::DeviceView;

/// Hard ceiling on how long [`wait_for_disconnect`] will wait for a `Connected=false` transition
/// before giving up and treating it as already done.
pub const WAIT_FOR_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval used by [`wait_for_device_to_reappear`].
pub const REAPPEAR_WAIT_INTERVAL: Duration = Duration::from_millis(250);

/// Wait for `device` to report `Connected=false`, topping up to `min_wait` if the transition
/// happens quickly. If `device` has no bus path, or the path disappears from the bus entirely
/// (the documented behaviour when an adapter runs out of slots and ejects the peer), just sleep
/// `min_wait` outright.
pub async fn wait_for_disconnect(view: &dyn DeviceView, device: &BleDevice, min_wait: Duration) {
    let Some(path) = device.path() else {
        tokio::time::sleep(min_wait).await;
        return;
    };

    let start = Instant::now();
    let outcome = tokio::time::timeout(WAIT_FOR_DISCONNECT_TIMEOUT, wait_until_disconnected(view, path)).await;

    match outcome {
        Ok(PathOutcome::Disconnected) => {
            let waited = start.elapsed();
            log::debug!("{} - {}: waited {:?} to disconnect", device.address, path, waited);
            if waited < min_wait {
                tokio::time::sleep(min_wait - waited).await;
            }
        }
        Ok(PathOutcome::PathDisappeared) => {
            log::debug!(
                "{} - {}: device was removed from bus, waiting {:?} for it to re-appear",
                device.address,
                path,
                min_wait
            );
            tokio::time::sleep(min_wait).await;
        }
        Err(_) => {
            log::debug!("{} - {}: failed waiting for disconnect", device.address, path);
        }
    }
}

enum PathOutcome {
    Disconnected,
    PathDisappeared,
}

async fn wait_until_disconnected(view: &dyn DeviceView, path: &str) -> PathOutcome {
    loop {
        match view.get_properties().await {
            Ok(properties) => match properties.get(path).and_then(|ifaces| ifaces.get("org.bluez.Device1")) {
                None => return PathOutcome::PathDisappeared,
                Some(props) => {
                    let connected = props
                        .get("Connected")
                        .and_then(|v| dbus::arg::RefArg::as_u64(&v.0))
                        .map(|v| v != 0)
                        .unwrap_or(false);
                    if !connected {
                        return PathOutcome::Disconnected;
                    }
                }
            },
            Err(_) => return PathOutcome::PathDisappeared,
        }
        tokio::time::sleep(REAPPEAR_WAIT_INTERVAL).await;
    }
}

/// Poll for any sibling path of `device`'s address to show up in the view, at
/// [`REAPPEAR_WAIT_INTERVAL`], until `max_wait` elapses. Returns `true` as soon as one appears,
/// `false` on timeout.
pub async fn wait_for_device_to_reappear(view: &dyn DeviceView, device: &BleDevice, max_wait: Duration) -> bool {
    let Some(path) = device.path() else { return true };
    let deadline = Instant::now() + max_wait;
    loop {
        if let Ok(properties) = view.get_properties().await {
            if sibling_paths(path).iter().any(|sibling| properties.contains_key(sibling)) {
                return true;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(REAPPEAR_WAIT_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceDetails, NO_RSSI};
    use crate::macaddress::MacAddress;
    use crate::view::{PropertiesSnapshot, ViewError, WatcherHandle};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeView {
        snapshot: Mutex<PropertiesSnapshot>,
    }

    #[async_trait]
    impl DeviceView for FakeView {
        async fn get_properties(&self) -> Result<PropertiesSnapshot, ViewError> {
            Ok(self.snapshot.lock().await.clone())
        }
        async fn is_connected(&self, _path: &str) -> bool {
            false
        }
        async fn add_device_watcher(
            &self,
            _path: &str,
            _on_connected_changed: Box<dyn Fn(bool) + Send + Sync>,
            _on_char_changed: Box<dyn Fn() + Send + Sync>,
        ) -> Result<WatcherHandle, ViewError> {
            unimplemented!()
        }
        async fn remove_device_watcher(&self, _handle: WatcherHandle) {}
    }

    fn device(path: &str) -> BleDevice {
        BleDevice {
            address: "AA:BB:CC:DD:EE:FF".parse::<MacAddress>().unwrap(),
            name: None,
            details: DeviceDetails::BlueZ {
                path: path.to_string(),
                adapter: "hci0".to_string(),
            },
            rssi: NO_RSSI,
            services: vec![],
            manufacturer_data: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn reappear_returns_true_immediately_when_present() {
        let view = FakeView::default();
        let path = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";
        view.snapshot.lock().await.insert(path.to_string(), HashMap::new());
        let found = wait_for_device_to_reappear(&view, &device(path), Duration::from_millis(50)).await;
        assert!(found);
    }

    #[tokio::test]
    async fn reappear_times_out_when_absent() {
        let view = FakeView::default();
        let path = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";
        let found = wait_for_device_to_reappear(&view, &device(path), Duration::from_millis(30)).await;
        assert!(!found);
    }

    #[tokio::test]
    async fn no_path_device_sleeps_min_wait_only() {
        let view = FakeView::default();
        let device = BleDevice::new("AA:BB:CC:DD:EE:FF".parse().unwrap());
        let start = Instant::now();
        wait_for_disconnect(&view, &device, Duration::from_millis(20)).await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
