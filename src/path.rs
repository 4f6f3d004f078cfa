//! The deterministic, reversible mapping between a device address, an adapter, and the BlueZ
//! D-Bus object path it lives at.

use crate::macaddress::MacAddress;

/// Number of adapters probed when enumerating sibling paths for an address (`hci0..hci8`).
pub const SIBLING_ADAPTER_COUNT: u32 = 9;

/// Build the BlueZ object path for `address` on `adapter`, e.g. `hci0` + `AA:BB:CC:DD:EE:FF` ->
/// `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`.
pub fn address_to_path(address: MacAddress, adapter: &str) -> String {
    format!("/org/bluez/{}/dev_{}", adapter, address.path_segment())
}

/// Extract the adapter id (e.g. `"hci0"`) from a device object path.
///
/// Returns `None` if `path` doesn't look like `/org/bluez/hci<N>/dev_...`.
pub fn adapter_of(path: &str) -> Option<&str> {
    let mut segments = path.trim_start_matches('/').split('/');
    if segments.next()? != "org" || segments.next()? != "bluez" {
        return None;
    }
    segments.next()
}

/// Extract and parse the device address embedded in a device object path.
///
/// Returns `None` if `path` isn't a well-formed device path for some adapter.
pub fn address_of(path: &str) -> Option<MacAddress> {
    let dev_segment = path.rsplit('/').next()?;
    let hex = dev_segment.strip_prefix("dev_")?;
    let colon_form = hex.replace('_', ":");
    colon_form.parse().ok()
}

/// Enumerate the `SIBLING_ADAPTER_COUNT` object paths that `path`'s device could appear under on
/// a different adapter (including `path` itself), by substituting the adapter index.
///
/// `path` must be a device path of the form `/org/bluez/hci<N>/dev_...`; indices 0..9 are tried
/// regardless of what `N` originally was, since the adapter count on a host is not known here.
pub fn sibling_paths(path: &str) -> Vec<String> {
    let Some(adapter) = adapter_of(path) else {
        return vec![];
    };
    let Some(rest) = path.strip_prefix(&format!("/org/bluez/{}", adapter)) else {
        return vec![];
    };
    let digit_start = adapter
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(adapter.len());
    let prefix = &adapter[..digit_start];
    (0..SIBLING_ADAPTER_COUNT)
        .map(|i| format!("/org/bluez/{}{}{}", prefix, i, rest))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_to_path_round_trip() {
        let address: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let path = address_to_path(address, "hci2");
        assert_eq!(path, "/org/bluez/hci2/dev_AA_BB_CC_DD_EE_FF");
        assert_eq!(adapter_of(&path), Some("hci2"));
        assert_eq!(address_of(&path), Some(address));
    }

    #[test]
    fn round_trip_is_identity_for_any_adapter() {
        let address: MacAddress = "11:22:33:44:55:66".parse().unwrap();
        for n in 0..9 {
            let adapter = format!("hci{}", n);
            let path = address_to_path(address, &adapter);
            assert_eq!(adapter_of(&path), Some(adapter.as_str()));
            assert_eq!(address_of(&path), Some(address));
        }
    }

    #[test]
    fn siblings_cover_hci0_to_hci8() {
        let path = "/org/bluez/hci3/dev_AA_BB_CC_DD_EE_FF";
        let siblings = sibling_paths(path);
        assert_eq!(siblings.len(), 9);
        for (i, sibling) in siblings.iter().enumerate() {
            assert_eq!(sibling, &format!("/org/bluez/hci{}/dev_AA_BB_CC_DD_EE_FF", i));
        }
        assert!(siblings.contains(&path.to_string()));
    }

    #[test]
    fn malformed_path_has_no_siblings() {
        assert_eq!(sibling_paths("/not/a/bluez/path"), Vec::<String>::new());
    }
}
