//! A read-only view over a BlueZ-style D-Bus object tree: `org.freedesktop.DBus.ObjectManager`'s
//! managed-object tree, plus per-path `Connected` change notifications.
//!
//! Grounded on `bluez-async::BluetoothSession` (`get_adapters`/`get_devices` both walk
//! `ObjectManager::get_managed_objects`) and on the BlueZ manager latch behaviour in
//! `bleak_retry_connector.bluez.get_global_bluez_manager_with_timeout`: the first time the bus
//! can't be reached within [`DBUS_CONNECT_TIMEOUT`], that unavailability is cached so later calls
//! don't each pay the connect timeout again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbus::arg::{PropMap, RefArg, Variant};
use dbus::nonblock::stdintf::org_freedesktop_dbus::{ObjectManager, Properties};
use dbus::nonblock::{MsgMatch, Proxy, SyncConnection};
use dbus::strings::Interface;
use dbus_tokio::connection::IOResourceError;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// Default bound on establishing the D-Bus connection before the unavailability latch trips.
pub const DBUS_CONNECT_TIMEOUT: Duration = Duration::from_millis(8500);

const DBUS_METHOD_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const BLUEZ_DEVICE_INTERFACE: &str = "org.bluez.Device1";

/// A snapshot of `{path: {interface: {property: value}}}`, exactly the shape `ObjectManager`
/// hands back.
pub type PropertiesSnapshot = HashMap<String, HashMap<String, PropMap>>;

#[derive(Debug, Error)]
pub enum ViewError {
    /// The platform bus could not be reached (or is latched as unreachable).
    #[error("D-Bus is not available")]
    NoBus,
    #[error(transparent)]
    DBus(#[from] dbus::Error),
}

/// Opaque token for an installed `Connected`-change watcher. Ownership is always the caller's
/// (in this crate, the slot manager's); it is never inspected, only handed back to
/// [`DeviceView::remove_device_watcher`].
pub struct WatcherHandle(JoinHandle<()>);

impl WatcherHandle {
    /// Build a handle around an already-spawned task. Public so a test or third-party
    /// [`DeviceView`] implementation can construct one without reaching for `unsafe`.
    pub fn new(task: JoinHandle<()>) -> Self {
        WatcherHandle(task)
    }
}

/// Read-only abstraction over a platform bus snapshot, narrow enough that non-BlueZ hosts can
/// implement it as a permissive stub (see [`NullView`]).
#[async_trait]
pub trait DeviceView: Send + Sync {
    /// Fetch the current properties snapshot. Fails with [`ViewError::NoBus`] if the platform
    /// bus can't be reached; callers should treat that the same as "no information available"
    /// rather than retry in a tight loop.
    async fn get_properties(&self) -> Result<PropertiesSnapshot, ViewError>;

    /// Whether `path` currently has `Connected=true`. `false` if the path is unknown or the bus
    /// is unavailable.
    async fn is_connected(&self, path: &str) -> bool;

    /// Install a watcher that invokes `on_connected_changed` whenever `path`'s `Connected`
    /// property changes, and `on_char_changed` on any other property change notification for the
    /// path (this crate doesn't itself drive GATT characteristic updates, so most implementors
    /// never call it; it exists so a caller can share one watcher installation point for both).
    async fn add_device_watcher(
        &self,
        path: &str,
        on_connected_changed: Box<dyn Fn(bool) + Send + Sync>,
        on_char_changed: Box<dyn Fn() + Send + Sync>,
    ) -> Result<WatcherHandle, ViewError>;

    /// Tear down a previously installed watcher.
    async fn remove_device_watcher(&self, handle: WatcherHandle);
}

/// A `DeviceView` backed by a live BlueZ D-Bus connection.
pub struct BlueZView {
    connection: AsyncMutex<Option<Arc<SyncConnection>>>,
    latched_unavailable: AtomicBool,
    connect_timeout: Duration,
}

impl BlueZView {
    /// Construct a view that will lazily connect to the system bus on first use.
    pub fn new() -> Self {
        Self::with_connect_timeout(DBUS_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        BlueZView {
            connection: AsyncMutex::new(None),
            latched_unavailable: AtomicBool::new(false),
            connect_timeout,
        }
    }

    /// Clear the bus-unavailability latch. Exposed for tests that simulate the bus becoming
    /// available again without restarting the process.
    pub fn reset_latch(&self) {
        self.latched_unavailable.store(false, Ordering::SeqCst);
    }

    async fn connection(&self) -> Result<Arc<SyncConnection>, ViewError> {
        if self.latched_unavailable.load(Ordering::SeqCst) {
            return Err(ViewError::NoBus);
        }
        let mut guard = self.connection.lock().await;
        if let Some(connection) = &*guard {
            return Ok(connection.clone());
        }
        match tokio::time::timeout(self.connect_timeout, connect_system_bus()).await {
            Ok(Ok((resource, connection))) => {
                tokio::spawn(resource);
                *guard = Some(connection.clone());
                Ok(connection)
            }
            Ok(Err(_)) | Err(_) => {
                self.latched_unavailable.store(true, Ordering::SeqCst);
                log::debug!("D-Bus system bus unavailable; latching until reset");
                Err(ViewError::NoBus)
            }
        }
    }

}

impl Default for BlueZView {
    fn default() -> Self {
        Self::new()
    }
}

async fn connect_system_bus(
) -> Result<(impl Future<Output = IOResourceError>, Arc<SyncConnection>), dbus::Error>
{
    dbus_tokio::connection::new_system_sync()
}

#[async_trait]
impl DeviceView for BlueZView {
    async fn get_properties(&self) -> Result<PropertiesSnapshot, ViewError> {
        let connection = self.connection().await?;
        let bluez_root = Proxy::new("org.bluez", "/", DBUS_METHOD_CALL_TIMEOUT, connection);
        let tree = bluez_root.get_managed_objects().await?;
        Ok(tree
            .into_iter()
            .map(|(path, interfaces)| {
                (
                    path.to_string(),
                    interfaces
                        .into_iter()
                        .map(|(interface, props)| (interface, props))
                        .collect(),
                )
            })
            .collect())
    }

    async fn is_connected(&self, path: &str) -> bool {
        let properties = match self.get_properties().await {
            Ok(properties) => properties,
            Err(_) => return false,
        };
        properties
            .get(path)
            .and_then(|interfaces| interfaces.get(BLUEZ_DEVICE_INTERFACE))
            .and_then(|props| props.get("Connected"))
            .and_then(|value| value.0.as_u64())
            .map(|value| value != 0)
            .unwrap_or(false)
    }

    async fn add_device_watcher(
        &self,
        path: &str,
        on_connected_changed: Box<dyn Fn(bool) + Send + Sync>,
        on_char_changed: Box<dyn Fn() + Send + Sync>,
    ) -> Result<WatcherHandle, ViewError> {
        let connection = self.connection().await?;
        let mut rule = dbus::message::MatchRule::new();
        rule.path = Some(dbus::Path::new(path.to_owned()).map_err(|_| ViewError::NoBus)?);
        rule.interface = Some(Interface::new("org.freedesktop.DBus.Properties").unwrap());
        rule.member = Some("PropertiesChanged".into());

        let msg_match: MsgMatch = connection.add_match(rule).await?;
        let connection_for_drop = connection.clone();
        let (msg_match, mut stream) = msg_match.msg_stream();

        let task = tokio::spawn(async move {
            let _keep_alive = msg_match;
            while let Some(message) = stream.next().await {
                let Ok((interface, changed, _invalidated)): Result<(String, PropMap, Vec<String>), _> =
                    message.read3()
                else {
                    continue;
                };
                if interface != BLUEZ_DEVICE_INTERFACE {
                    continue;
                }
                if let Some(connected) = changed.get("Connected").and_then(|v| v.0.as_u64()) {
                    on_connected_changed(connected != 0);
                } else if !changed.is_empty() {
                    on_char_changed();
                }
            }
            let _ = connection_for_drop;
        });

        Ok(WatcherHandle::new(task))
    }

    async fn remove_device_watcher(&self, handle: WatcherHandle) {
        handle.0.abort();
    }
}

/// Permissive stub for hosts without BlueZ-style introspection (spec §1 Non-goal: where
/// platform introspection is unavailable, degrade rather than fail).
#[derive(Default)]
pub struct NullView;

#[async_trait]
impl DeviceView for NullView {
    async fn get_properties(&self) -> Result<PropertiesSnapshot, ViewError> {
        Err(ViewError::NoBus)
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
        Err(ViewError::NoBus)
    }

    async fn remove_device_watcher(&self, _handle: WatcherHandle) {}
}

/// Pull the byte-string manufacturer data map out of a raw `PropMap` value, as produced by
/// `ObjectManager::get_managed_objects` for the `ManufacturerData` property. Shared by the
/// arbiter when it turns a properties snapshot into a [`crate::device::BleDevice`].
pub fn manufacturer_data_from_variant(data: &HashMap<u16, Variant<Box<dyn RefArg>>>) -> HashMap<u16, Vec<u8>> {
    data.iter()
        .filter_map(|(&k, v)| v.0.as_any().downcast_ref::<Vec<u8>>().map(|v| (k, v.clone())))
        .collect()
}
