//! Redump key-dump parsing
//!
//! A redump dump is a flat file holding only the decrypted disc key: either
//! 16 raw bytes or 32 hex characters. No reference hashes come with it, so a
//! dump driven by a redump key can only validate as `Unknown`.

use std::path::Path;

use crate::cipher::DiscKey;
use crate::error::{DumpError, Result};

/// Load a key dump from disk.
pub fn parse_key_file(path: &Path) -> Result<DiscKey> {
    parse_key_bytes(&std::fs::read(path)?)
}

/// Parse key-dump contents: raw 16 bytes, or 32 hex characters with
/// surrounding whitespace tolerated.
pub fn parse_key_bytes(data: &[u8]) -> Result<DiscKey> {
    if data.len() == 16 {
        let mut key = [0u8; 16];
        key.copy_from_slice(data);
        return Ok(key);
    }

    let text = std::str::from_utf8(data)
        .map_err(|_| DumpError::InvalidKey("neither raw bytes nor hex text".into()))?
        .trim();
    if text.len() != 32 {
        return Err(DumpError::InvalidKey(format!(
            "expected 16 bytes or 32 hex characters, got {} bytes",
            data.len()
        )));
    }

    let bytes = hex::decode(text)
        .map_err(|_| DumpError::InvalidKey("invalid hex characters".into()))?;
    let mut key = [0u8; 16];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_bytes() {
        let key = parse_key_bytes(&[0x5Au8; 16]).unwrap();
        assert_eq!(key, [0x5A; 16]);
    }

    #[test]
    fn test_parse_hex_text() {
        let key = parse_key_bytes(b"00112233445566778899AABBCCDDEEFF\n").unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[15], 0xFF);
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(parse_key_bytes(b"0011223344").is_err());
    }

    #[test]
    fn test_rejects_non_hex() {
        assert!(parse_key_bytes(b"zz112233445566778899AABBCCDDEEFF").is_err());
    }
}
