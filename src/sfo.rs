//! PARAM.SFO table parsing
//!
//! The SFO is a typed key/value table. A little-endian header points at a key
//! name table and a data table; 16-byte index entries tie the two together.

use crate::error::{DumpError, Result};

/// SFO magic: NUL followed by "PSF"
pub const SFO_MAGIC: [u8; 4] = [0x00, b'P', b'S', b'F'];

/// Entry format: UTF-8 string (NUL terminated).
const FMT_UTF8: u16 = 0x0204;
/// Entry format: UTF-8 string without terminator.
const FMT_UTF8_RAW: u16 = 0x0004;
/// Entry format: 32-bit integer.
const FMT_U32: u16 = 0x0404;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SfoValue {
    Text(String),
    Integer(u32),
}

/// Parsed `PARAM.SFO` table.
#[derive(Debug, Clone)]
pub struct ParamSfo {
    entries: Vec<(String, SfoValue)>,
}

fn le_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| DumpError::InvalidSfo("header truncated".into()))
}

impl ParamSfo {
    /// Parse a PARAM.SFO from its raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 0x14 {
            return Err(DumpError::InvalidSfo("file too small".into()));
        }
        if data[0..4] != SFO_MAGIC {
            return Err(DumpError::InvalidSfo(format!(
                "bad magic {:02X?}",
                &data[0..4]
            )));
        }

        let key_table = le_u32(data, 0x08)? as usize;
        let data_table = le_u32(data, 0x0C)? as usize;
        let count = le_u32(data, 0x10)? as usize;

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let entry = 0x14 + i * 0x10;
            let raw = data
                .get(entry..entry + 0x10)
                .ok_or_else(|| DumpError::InvalidSfo("index table truncated".into()))?;

            let key_offset = u16::from_le_bytes([raw[0], raw[1]]) as usize;
            let fmt = u16::from_le_bytes([raw[2], raw[3]]);
            let len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
            let data_offset =
                u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]) as usize;

            let key_start = key_table + key_offset;
            let key_end = data[key_start..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| key_start + p)
                .ok_or_else(|| DumpError::InvalidSfo("unterminated key name".into()))?;
            let key = String::from_utf8_lossy(&data[key_start..key_end]).to_string();

            let value_start = data_table + data_offset;
            let value_raw = data
                .get(value_start..value_start + len)
                .ok_or_else(|| DumpError::InvalidSfo(format!("value of {key} truncated")))?;

            let value = match fmt {
                FMT_UTF8 | FMT_UTF8_RAW => {
                    SfoValue::Text(String::from_utf8_lossy(value_raw).to_string())
                }
                FMT_U32 if len >= 4 => SfoValue::Integer(u32::from_le_bytes([
                    value_raw[0],
                    value_raw[1],
                    value_raw[2],
                    value_raw[3],
                ])),
                other => {
                    return Err(DumpError::InvalidSfo(format!(
                        "unsupported entry format {other:#06x} for {key}"
                    )))
                }
            };

            entries.push((key, value));
        }

        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&SfoValue> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// A text value, NUL/space-trimmed, with newline runs collapsed to a
    /// single space (multi-line titles are stored with embedded newlines).
    pub fn string_value(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            SfoValue::Text(raw) => Some(normalize_text(raw)),
            SfoValue::Integer(_) => None,
        }
    }
}

fn normalize_text(raw: &str) -> String {
    raw.split(['\r', '\n'])
        .map(|line| line.trim_matches(['\0', ' ']))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
