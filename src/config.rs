//! Process-wide defaults and per-call options for the retry engine.
//!
//! Per spec.md §9's "module-global latches become process-wide state with explicit init/reset"
//! note: the Python source keeps these as bare module constants; here they're fields on a struct
//! with a `Default` impl, threaded explicitly through [`crate::retry::establish_connection`]
//! rather than read off globals.

use std::time::Duration;

/// Defaults and tunables for the retry engine, grounded on the constants scattered across
/// `bleak_retry_connector/__init__.py` and `bluez.py`.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Per-attempt connect timeout passed to the client.
    pub bleak_timeout: Duration,
    /// Outer safety timeout wrapping the connect call; must strictly exceed `bleak_timeout`
    /// since some backends can hang past their nominal timeout.
    pub bleak_safety_timeout: Duration,
    /// Per-disconnect timeout used by the stale reaper.
    pub disconnect_timeout: Duration,
    /// Bound on establishing the platform bus connection before the view's unavailability latch
    /// trips.
    pub dbus_connect_timeout: Duration,
    /// Minimum RSSI margin the path arbiter requires before switching adapters.
    pub rssi_switch_threshold: i16,
    /// `transient_errors` ceiling; reaching it is terminal regardless of `max_attempts`.
    pub max_transient_errors: u32,
    /// `timeouts + connect_errors` ceiling; reaching it is terminal.
    pub max_attempts: u32,
    /// Poll interval for [`crate::wait::wait_for_device_to_reappear`].
    pub reappear_wait_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            bleak_timeout: Duration::from_secs(20),
            bleak_safety_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(5),
            dbus_connect_timeout: Duration::from_millis(8500),
            rssi_switch_threshold: 5,
            max_transient_errors: 9,
            max_attempts: 4,
            reappear_wait_interval: Duration::from_millis(250),
        }
    }
}
