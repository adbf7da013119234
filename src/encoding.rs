//! Byte encoding/decoding helpers (utf8/hex/base64).
//!
//! spec.md treats this as an external collaborator, with one explicit Open
//! Question: the original used platform `atob`/`btoa` for base64, which an
//! implementer should replace with a direct codec. This module does that,
//! using the `base64`/`hex` crates directly rather than any
//! locale/platform-dependent shim.

use crate::error::{Error, Result};
use base64::Engine;

/// Decode a utf-8 string to bytes.
pub fn utf8_encode(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

/// Encode bytes as a utf-8 string, replacing invalid sequences.
pub fn utf8_decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Encode bytes as lowercase hex.
pub fn hex_encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decode a hex string to bytes.
pub fn hex_decode(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| Error::invalid(format!("invalid hex: {e}")))
}

/// Encode bytes as standard base64.
pub fn base64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode a base64 string to bytes.
pub fn base64_decode(s: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| Error::invalid(format!("invalid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let data = b"hello, vfs";
        assert_eq!(utf8_decode(&utf8_encode("hello")), "hello");
        assert_eq!(hex_decode(&hex_encode(data)).unwrap(), data);
        assert_eq!(base64_decode(&base64_encode(data)).unwrap(), data);
    }
}
