//! The narrow capability set this crate requires from a concrete GATT client implementation.
//!
//! Grounded on the `BleakClient` duck-typed contract `establish_connection` actually calls in
//! `bleak_retry_connector/__init__.py` (`connect`/`disconnect`/`clear_cache`), narrowed to an
//! `async_trait` the way `bluez-async`'s own backend traits are expressed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::device::BleDevice;
use crate::error::TransportError;

/// Invoked by a [`GattClient`] implementation when the platform reports the connection dropped.
pub type DisconnectedCallback = Arc<dyn Fn() + Send + Sync>;

/// The minimal capability set a GATT backend must provide. Characteristic/service/descriptor
/// access, pairing, and advertisement scanning are all out of scope (spec.md §1 Non-goals) — this
/// crate only drives connection lifecycle.
#[async_trait]
pub trait GattClient: Send + Sync {
    /// Connect with a per-attempt timeout and an optional hint to trust a previously cached
    /// services collection rather than re-running discovery.
    async fn connect(&mut self, timeout: Duration, use_cached_services: bool) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Discard any cached GATT services/handles for this device, if the backend keeps one.
    /// Backends without a cache treat this as a no-op.
    async fn clear_cache(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Builds a new [`GattClient`] bound to a specific [`BleDevice`], mirroring
/// `client_class(device, disconnected_callback=..., _is_retry_client=True, **kwargs)` in the
/// Python source. Boxed rather than generic so [`crate::retry::establish_connection`] can be a
/// plain async fn instead of a type parameter explosion.
pub type ClientFactory =
    Arc<dyn Fn(&BleDevice, Option<DisconnectedCallback>) -> Box<dyn GattClient> + Send + Sync>;

impl fmt::Debug for dyn GattClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GattClient")
    }
}
