use thiserror::Error;

use crate::classify::ErrorClass;
use crate::device::BleDevice;

/// The narrow set of tags a [`crate::client::GattClient`] implementation maps its own backend
/// errors onto before they reach the classifier. Type before message: the classifier checks the
/// variant first, and only falls back to matching `message`/`Other`'s payload against the
/// taxonomy keyword sets.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("broken pipe: {0}")]
    BrokenPipe(String),
    #[error("unexpected end of file: {0}")]
    Eof(String),
    #[error("D-Bus error: {0}")]
    DBus(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// The message text to substring-match against the taxonomy keyword sets.
    pub fn message(&self) -> &str {
        match self {
            TransportError::Timeout => "operation timed out",
            TransportError::BrokenPipe(m)
            | TransportError::Eof(m)
            | TransportError::DBus(m)
            | TransportError::DeviceNotFound(m)
            | TransportError::Other(m) => m,
        }
    }
}

/// The taxonomy surfaced to callers once an attempt sequence is terminal. Each variant carries
/// the fully formatted message described in the error handling design: `"<name> - <device
/// description>: Failed to connect after <attempts> attempt(s): <original message>[: <advice>]"`.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("{0}")]
    NotFound(String, #[source] Box<TransportError>),
    #[error("{0}")]
    OutOfSlots(String, #[source] Box<TransportError>),
    #[error("{0}")]
    Aborted(String, #[source] Box<TransportError>),
    #[error("{0}")]
    ConnectionError(String, #[source] Box<TransportError>),
    /// The caller's cancellation future resolved before a connection was established.
    #[error("connection attempt cancelled")]
    Cancelled,
}

const NOT_FOUND_ADVICE: &str = "try restarting the scanner or moving the device closer";
const OUT_OF_SLOTS_ADVICE: &str = "the proxy/adapter is out of connection slots; add more proxies near this device";
const ABORTED_ADVICE: &str = "interference/range; an external adapter with an extension cable may help; extension cables reduce USB 3 interference";

/// Build the terminal, user-facing error for a classified attempt sequence.
pub fn terminal_error(
    class: ErrorClass,
    device: &BleDevice,
    logical_name: &str,
    attempts: u32,
    source: TransportError,
) -> ConnectError {
    let description = device.description();
    let address = device.address.to_string();
    let prefix = if logical_name != address {
        format!(
            "{} - {}: Failed to connect after {} attempt(s): {}",
            logical_name,
            description,
            attempts,
            source.message()
        )
    } else {
        format!(
            "{}: Failed to connect after {} attempt(s): {}",
            description,
            attempts,
            source.message()
        )
    };

    match class {
        ErrorClass::Timeout | ErrorClass::DeviceMissing => {
            ConnectError::NotFound(format!("{}: {}", prefix, NOT_FOUND_ADVICE), Box::new(source))
        }
        ErrorClass::OutOfSlots => ConnectError::OutOfSlots(
            format!("{}: {}", prefix, OUT_OF_SLOTS_ADVICE),
            Box::new(source),
        ),
        ErrorClass::Transient | ErrorClass::TransientMedium | ErrorClass::TransientLong | ErrorClass::Aborted => {
            ConnectError::Aborted(format!("{}: {}", prefix, ABORTED_ADVICE), Box::new(source))
        }
        ErrorClass::NormalDisconnect | ErrorClass::Unknown => {
            ConnectError::ConnectionError(prefix, Box::new(source))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceDetails;

    fn device() -> BleDevice {
        BleDevice {
            address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            name: None,
            details: DeviceDetails::Unknown,
            rssi: crate::device::NO_RSSI,
            services: vec![],
            manufacturer_data: Default::default(),
        }
    }

    #[test]
    fn timeout_terminal_message_has_attempt_count_and_advice() {
        let err = terminal_error(
            ErrorClass::Timeout,
            &device(),
            "AA:BB:CC:DD:EE:FF",
            4,
            TransportError::Timeout,
        );
        let message = err.to_string();
        assert!(message.contains("after 4 attempt(s)"));
        assert!(message.contains("restarting the scanner"));
        assert!(matches!(err, ConnectError::NotFound(_, _)));
    }

    #[test]
    fn distinct_logical_name_is_included() {
        let err = terminal_error(
            ErrorClass::Timeout,
            &device(),
            "kitchen sensor",
            4,
            TransportError::Timeout,
        );
        assert!(err.to_string().starts_with("kitchen sensor - "));
    }

    #[test]
    fn out_of_slots_terminal_message() {
        let err = terminal_error(
            ErrorClass::OutOfSlots,
            &device(),
            "AA:BB:CC:DD:EE:FF",
            4,
            TransportError::Other("no available connection slots".to_string()),
        );
        assert!(matches!(err, ConnectError::OutOfSlots(_, _)));
        assert!(err.to_string().contains("out of connection slots"));
    }
}
