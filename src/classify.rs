//! Pure mapping from a raw transport error to a stable `(ErrorClass, BackoffClass)` pair.
//!
//! Precedence is type before message: [`TransportError`]'s variant is checked first, and only an
//! `Other` (untagged) error falls through to substring matching against the keyword sets below,
//! in a fixed order. That order matters: `ESP_GATT_CONN_CONN_CANCEL` appears in both the
//! out-of-slots and transient sets, and `ESP_GATT_CONN_FAIL_ESTABLISH` appears in both the
//! transient and transient-medium sets. Checking out-of-slots first and transient-medium second
//! resolves both overlaps the way the upstream connector does.

use std::time::Duration;

use crate::error::TransportError;

/// The stable, small taxonomy a raw transport error is classified into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    Timeout,
    Transient,
    TransientMedium,
    TransientLong,
    OutOfSlots,
    DeviceMissing,
    NormalDisconnect,
    Aborted,
    Unknown,
}

/// The backoff duration family selected for a classified error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackoffClass {
    DBus,
    Transient,
    TransientMedium,
    TransientLong,
    OutOfSlots,
    NormalDisconnect,
    Default,
}

impl BackoffClass {
    /// The base backoff duration for this class, per the documented defaults.
    pub fn duration(self) -> Duration {
        let millis = match self {
            BackoffClass::DBus => 250,
            BackoffClass::Transient => 250,
            BackoffClass::TransientMedium => 900,
            BackoffClass::TransientLong => 1250,
            BackoffClass::OutOfSlots => 4000,
            BackoffClass::NormalDisconnect => 0,
            BackoffClass::Default => 100,
        };
        Duration::from_millis(millis)
    }
}

const TRANSIENT: &[&str] = &[
    "le-connection-abort-by-local",
    "br-connection-canceled",
    "ESP_GATT_CONN_FAIL_ESTABLISH",
    "ESP_GATT_CONN_TERMINATE_PEER_USER",
    "ESP_GATT_CONN_TERMINATE_LOCAL_HOST",
    "ESP_GATT_CONN_CONN_CANCEL",
];

const TRANSIENT_MEDIUM: &[&str] = &["ESP_GATT_CONN_TIMEOUT", "ESP_GATT_CONN_FAIL_ESTABLISH"];

const TRANSIENT_LONG: &[&str] = &["ESP_GATT_ERROR"];

const OUT_OF_SLOTS: &[&str] = &[
    "available connection",
    "connection slot",
    "ESP_GATT_CONN_CONN_CANCEL",
];

const DEVICE_MISSING: &[&str] = &["org.freedesktop.DBus.Error.UnknownObject", "not found"];

const NORMAL_DISCONNECT: &str = "Disconnected";

fn message_contains_any(message: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| message.contains(keyword))
}

/// Classify a raw transport error into its `(ErrorClass, BackoffClass)` pair. Pure and
/// allocation-free beyond whatever the caller's error message already owns.
pub fn classify(err: &TransportError) -> (ErrorClass, BackoffClass) {
    match err {
        TransportError::Timeout => return (ErrorClass::Timeout, BackoffClass::DBus),
        TransportError::BrokenPipe(_) | TransportError::Eof(_) => {
            return (ErrorClass::Transient, BackoffClass::DBus)
        }
        TransportError::DeviceNotFound(_) => {
            return (ErrorClass::OutOfSlots, BackoffClass::OutOfSlots)
        }
        // A DBus-tagged error always backs off at the fixed DBus rate, but its error class (used
        // for counters and terminal advice) still comes from the message, same as an untagged
        // error - the upstream connector backs these off identically to a plain timeout while
        // still substring-matching them for the user-facing taxonomy.
        TransportError::DBus(message) => return (classify_message(message), BackoffClass::DBus),
        TransportError::Other(_) => {}
    }

    let class = classify_message(err.message());
    let backoff = match class {
        ErrorClass::OutOfSlots => BackoffClass::OutOfSlots,
        ErrorClass::TransientMedium => BackoffClass::TransientMedium,
        ErrorClass::TransientLong => BackoffClass::TransientLong,
        ErrorClass::Transient => BackoffClass::Transient,
        ErrorClass::NormalDisconnect => BackoffClass::NormalDisconnect,
        _ => BackoffClass::Default,
    };
    (class, backoff)
}

/// Whether a message-classified error counts toward the retry engine's `transient_errors`
/// counter (as opposed to `connect_errors`). Narrower than "is this class transient-flavoured
/// for backoff purposes": the upstream connector's counting set is TRANSIENT ∪ OUT_OF_SLOTS only
/// — `TransientMedium`/`TransientLong` get a longer backoff but still count as a plain connect
/// error for termination purposes.
pub fn counts_as_transient(class: ErrorClass) -> bool {
    matches!(class, ErrorClass::Transient | ErrorClass::OutOfSlots)
}

fn classify_message(message: &str) -> ErrorClass {
    if message_contains_any(message, OUT_OF_SLOTS) {
        return ErrorClass::OutOfSlots;
    }
    if message_contains_any(message, TRANSIENT_MEDIUM) {
        return ErrorClass::TransientMedium;
    }
    if message_contains_any(message, TRANSIENT_LONG) {
        return ErrorClass::TransientLong;
    }
    if message_contains_any(message, TRANSIENT) {
        return ErrorClass::Transient;
    }
    if message_contains_any(message, DEVICE_MISSING) {
        return ErrorClass::DeviceMissing;
    }
    if message.contains(NORMAL_DISCONNECT) {
        return ErrorClass::NormalDisconnect;
    }
    ErrorClass::Unknown
}
