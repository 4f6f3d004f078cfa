//! Per-adapter connection-slot accounting, watcher lifecycle, and allocation events.
//!
//! Grounded line-for-line on `BleakSlotManager` in
//! `bleak_retry_connector/bluez.py`: `register_adapter`/`remove_adapter`/`allocate_slot`/
//! `release_slot` and the private `_allocate_and_watch_slot` pattern (here `install_watcher`).
//! `register_allocation_callback`/`AllocationChangeEvent` delivery are additions spec.md §4.D
//! requires that the Python source doesn't expose publicly (it only logs); they're modelled in
//! the idiom `bluez-async` uses for its own typed event feed (`BluetoothEvent`).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::device::BleDevice;
use crate::path::adapter_of;
use crate::view::{DeviceView, WatcherHandle};

/// Which side of an [`Allocation`] lifecycle an [`AllocationChangeEvent`] reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocationChange {
    Allocated,
    Released,
}

#[derive(Clone, Debug)]
pub struct AllocationChangeEvent {
    pub change: AllocationChange,
    pub path: String,
    pub adapter: String,
    pub address: crate::macaddress::MacAddress,
}

struct Allocation {
    address: crate::macaddress::MacAddress,
    watcher: WatcherHandle,
}

struct AdapterSlots {
    capacity: usize,
    allocations: HashMap<String, Allocation>,
}

type Listener = Box<dyn Fn(&AllocationChangeEvent) + Send + Sync>;

/// Tracks per-adapter connection-slot capacity and the allocations currently holding a slot.
///
/// With no [`DeviceView`] configured (non-BlueZ host), every operation degrades to a permissive
/// no-op/`true`, per spec.md §4.D.
pub struct SlotManager {
    view: Option<Arc<dyn DeviceView>>,
    adapters: Mutex<HashMap<String, AdapterSlots>>,
    listeners: Mutex<Vec<Listener>>,
}

impl SlotManager {
    /// Construct a manager. Returns an `Arc` because watcher callbacks (invoked by the platform
    /// bus on its own task) need a handle back into the manager to release a slot when a device
    /// disconnects.
    pub fn new(view: Option<Arc<dyn DeviceView>>) -> Arc<Self> {
        Arc::new(SlotManager {
            view,
            adapters: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Register `adapter` with `capacity` slots, pre-allocating any path under it that the view
    /// already reports `Connected=true` for (the platform made that allocation before we started
    /// watching; we reconcile rather than reject it).
    pub async fn register_adapter(self: &Arc<Self>, adapter: &str, capacity: usize) {
        let mut adapters = self.adapters.lock().await;
        adapters.insert(
            adapter.to_string(),
            AdapterSlots {
                capacity,
                allocations: HashMap::new(),
            },
        );
        drop(adapters);

        let Some(view) = &self.view else { return };
        let Ok(properties) = view.get_properties().await else {
            return;
        };
        for (path, ifaces) in properties {
            if adapter_of(&path) != Some(adapter) {
                continue;
            }
            let Some(props) = ifaces.get("org.bluez.Device1") else {
                continue;
            };
            let connected = props
                .get("Connected")
                .and_then(|v| dbus::arg::RefArg::as_u64(&v.0))
                .map(|v| v != 0)
                .unwrap_or(false);
            if !connected {
                continue;
            }
            let Some(address) = crate::path::address_of(&path) else {
                continue;
            };
            self.install_watcher(adapter, &path, address).await;
        }
    }

    /// Remove `adapter` and all its watchers. No per-slot events are emitted (bulk teardown).
    pub async fn remove_adapter(&self, adapter: &str) {
        let mut adapters = self.adapters.lock().await;
        let Some(slots) = adapters.remove(adapter) else {
            return;
        };
        drop(adapters);
        if let Some(view) = &self.view {
            for allocation in slots.allocations.into_values() {
                view.remove_device_watcher(allocation.watcher).await;
            }
        }
    }

    /// Attempt to allocate a slot for `device`. Returns `true` if the device is (or becomes)
    /// allocated a slot, `false` if the adapter is at capacity.
    pub async fn allocate_slot(self: &Arc<Self>, device: &BleDevice) -> bool {
        if self.view.is_none() {
            return true;
        }
        let Some(path) = device.path() else { return true };
        let Some(adapter) = device.adapter() else {
            return true;
        };

        {
            let adapters = self.adapters.lock().await;
            let Some(slots) = adapters.get(adapter) else {
                return true;
            };
            if slots.allocations.contains_key(path) {
                return true;
            }
            if slots.allocations.len() >= slots.capacity {
                log::debug!(
                    "no slots available for {} (used by: {:?})",
                    path,
                    slots.allocations.keys().collect::<Vec<_>>()
                );
                return false;
            }
        }
        self.install_watcher(adapter, path, device.address).await;
        true
    }

    /// Release the slot held for `device`, unless the view still reports it connected (the
    /// platform owns it in that case).
    pub async fn release_slot(&self, device: &BleDevice) {
        let Some(view) = &self.view else { return };
        let Some(path) = device.path() else { return };
        if view.is_connected(path).await {
            return;
        }
        self.release_path(path).await;
    }

    async fn install_watcher(self: &Arc<Self>, adapter: &str, path: &str, address: crate::macaddress::MacAddress) {
        let Some(view) = &self.view else { return };

        // The platform watcher callback is plain `Fn(bool)`, invoked from the bus's own task; it
        // can't `.await` the release directly, so it just forwards the edge over a channel to a
        // reconciler task that owns the async path back into `release_path`.
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let watched_path = path.to_string();
        let watcher = match view
            .add_device_watcher(
                path,
                Box::new(move |connected| {
                    if !connected {
                        let _ = tx.send(());
                    }
                }),
                Box::new(|| {}),
            )
            .await
        {
            Ok(handle) => handle,
            Err(_) => return,
        };

        let manager = self.clone();
        tokio::spawn(async move {
            if rx.recv().await.is_some() {
                manager.release_path(&watched_path).await;
            }
        });

        let mut adapters = self.adapters.lock().await;
        if let Some(slots) = adapters.get_mut(adapter) {
            slots
                .allocations
                .insert(path.to_string(), Allocation { address, watcher });
        }
        drop(adapters);

        self.emit(AllocationChangeEvent {
            change: AllocationChange::Allocated,
            path: path.to_string(),
            adapter: adapter.to_string(),
            address,
        })
        .await;
    }

    async fn release_path(&self, path: &str) {
        let Some(adapter) = adapter_of(path) else { return };
        let allocation = {
            let mut adapters = self.adapters.lock().await;
            adapters
                .get_mut(adapter)
                .and_then(|slots| slots.allocations.remove(path))
        };
        let Some(allocation) = allocation else { return };
        if let Some(view) = &self.view {
            view.remove_device_watcher(allocation.watcher).await;
        }
        self.emit(AllocationChangeEvent {
            change: AllocationChange::Released,
            path: path.to_string(),
            adapter: adapter.to_string(),
            address: allocation.address,
        })
        .await;
    }

    /// Subscribe to every [`AllocationChangeEvent`]. A panicking listener is caught and logged
    /// rather than unwinding into the allocate/release call that triggered it, so one bad
    /// listener can't take down the manager or starve the listeners registered after it.
    pub async fn register_allocation_callback(&self, listener: Listener) {
        self.listeners.lock().await.push(listener);
    }

    async fn emit(&self, event: AllocationChangeEvent) {
        for listener in self.listeners.lock().await.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(&event)));
            if let Err(panic) = result {
                log::error!("slot allocation listener panicked: {}", describe_panic(&panic));
            }
        }
    }

    /// `{adapter_slots, allocations_by_adapter, manager_present}`.
    pub async fn diagnostics(&self) -> SlotDiagnostics {
        let adapters = self.adapters.lock().await;
        SlotDiagnostics {
            manager_present: self.view.is_some(),
            adapter_slots: adapters.iter().map(|(a, s)| (a.clone(), s.capacity)).collect(),
            allocations_by_adapter: adapters
                .iter()
                .map(|(a, s)| (a.clone(), s.allocations.keys().cloned().collect()))
                .collect(),
        }
    }
}

#[derive(Debug)]
pub struct SlotDiagnostics {
    pub manager_present: bool,
    pub adapter_slots: HashMap<String, usize>,
    pub allocations_by_adapter: HashMap<String, Vec<String>>,
}

fn describe_panic(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceDetails;
    use crate::view::{PropertiesSnapshot, ViewError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeView {
        connected: Mutex<bool>,
    }

    #[async_trait]
    impl DeviceView for FakeView {
        async fn get_properties(&self) -> Result<PropertiesSnapshot, ViewError> {
            Ok(PropertiesSnapshot::new())
        }
        async fn is_connected(&self, _path: &str) -> bool {
            *self.connected.lock().await
        }
        async fn add_device_watcher(
            &self,
            _path: &str,
            _on_connected_changed: Box<dyn Fn(bool) + Send + Sync>,
            _on_char_changed: Box<dyn Fn() + Send + Sync>,
        ) -> Result<WatcherHandle, ViewError> {
            let handle = tokio::spawn(async {});
            Ok(WatcherHandle::new(handle))
        }
        async fn remove_device_watcher(&self, _handle: WatcherHandle) {}
    }

    fn device(path: &str) -> BleDevice {
        BleDevice {
            address: crate::path::address_of(path).unwrap(),
            name: None,
            details: DeviceDetails::BlueZ {
                path: path.to_string(),
                adapter: adapter_of(path).unwrap().to_string(),
            },
            rssi: crate::device::NO_RSSI,
            services: vec![],
            manufacturer_data: Default::default(),
        }
    }

    #[tokio::test]
    async fn allocate_respects_capacity_and_emits_events() {
        let manager = SlotManager::new(Some(Arc::new(FakeView::default())));
        manager.register_adapter("hci0", 1).await;

        let events = Arc::new(AtomicUsize::new(0));
        let events_for_closure = events.clone();
        manager
            .register_allocation_callback(Box::new(move |_event| {
                events_for_closure.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let dev0 = device("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");
        assert!(manager.allocate_slot(&dev0).await);
        assert_eq!(events.load(Ordering::SeqCst), 1);

        let dev1 = device("/org/bluez/hci0/dev_11_22_33_44_55_66");
        assert!(!manager.allocate_slot(&dev1).await);
        assert_eq!(events.load(Ordering::SeqCst), 1);

        manager.release_slot(&dev0).await;
        assert_eq!(events.load(Ordering::SeqCst), 2);

        assert!(manager.allocate_slot(&dev0).await);
        assert_eq!(events.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let manager = SlotManager::new(Some(Arc::new(FakeView::default())));
        manager.register_adapter("hci0", 1).await;
        let dev0 = device("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");
        assert!(manager.allocate_slot(&dev0).await);
        manager.release_slot(&dev0).await;
        manager.release_slot(&dev0).await;
        let diagnostics = manager.diagnostics().await;
        assert!(diagnostics.allocations_by_adapter["hci0"].is_empty());
    }

    #[tokio::test]
    async fn no_view_allocates_unconditionally() {
        let manager = SlotManager::new(None);
        let dev0 = device("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");
        assert!(manager.allocate_slot(&dev0).await);
        assert!(manager.diagnostics().await.manager_present == false);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_other_listeners_or_the_allocation() {
        let manager = SlotManager::new(Some(Arc::new(FakeView::default())));
        manager.register_adapter("hci0", 1).await;

        manager
            .register_allocation_callback(Box::new(|_event| panic!("boom")))
            .await;

        let events = Arc::new(AtomicUsize::new(0));
        let events_for_closure = events.clone();
        manager
            .register_allocation_callback(Box::new(move |_event| {
                events_for_closure.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let dev0 = device("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");
        assert!(manager.allocate_slot(&dev0).await);
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert!(manager.diagnostics().await.allocations_by_adapter["hci0"].contains(&dev0.path().unwrap().to_string()));
    }
}
