//! A connection resilience layer for BLE GATT clients sitting between an application and a
//! platform BLE stack (primarily BlueZ over D-Bus on Linux): a classifying retry engine, a
//! multi-adapter path arbiter, per-adapter slot accounting, and a stale-connection reaper.
//!
//! See `SPEC_FULL.md` for the module-by-module specification this crate implements, and
//! `DESIGN.md` for the grounding ledger tying each module back to its upstream source.

pub mod arbiter;
pub mod classify;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod macaddress;
pub mod path;
pub mod reaper;
pub mod retry;
pub mod slots;
pub mod view;
pub mod wait;

pub use arbiter::Arbiter;
pub use classify::{classify, BackoffClass, ErrorClass};
pub use client::{ClientFactory, DisconnectedCallback, GattClient};
pub use config::RetryConfig;
pub use device::{BleDevice, DeviceDetails, NO_RSSI};
pub use error::{ConnectError, TransportError};
pub use macaddress::{MacAddress, ParseMacAddressError};
pub use reaper::{close_stale_connections_by_address, StaleReaper};
pub use retry::{establish_connection, ConnectOptions, Counters, RetryEngine};
pub use slots::{AllocationChange, AllocationChangeEvent, SlotDiagnostics, SlotManager};
pub use view::{BlueZView, DeviceView, NullView, PropertiesSnapshot, ViewError, WatcherHandle};
pub use wait::{wait_for_device_to_reappear, wait_for_disconnect};
