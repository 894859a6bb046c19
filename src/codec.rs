//! Hex rendering of wire bytes.
//!
//! Commands are documented (and historically assembled) as strings of hex
//! pairs such as `41444C0157DD`. These helpers convert between that form and
//! raw bytes; the wire itself always carries the raw bytes.

use crate::errors::{BridgeError, Result};

/// Encode bytes as contiguous uppercase hex pairs.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Decode a string of hex pairs. Fails on odd length or any non-hex digit.
pub fn hex_to_bytes(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| BridgeError::MalformedHex(format!("{s:?}: {e}")))
}

/// Space separated rendering used in wire traces, e.g. `41 44 4C 01`.
pub fn spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
