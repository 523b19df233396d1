//! IRD archive parsing
//!
//! An IRD is a gzip-wrapped binary archive of disc metadata: identification
//! strings, gzipped copies of the disc header and footer, per-region and
//! per-file MD5 checksums, and the encrypted disc-key material (`Data1`).
//! Numbers are little-endian; strings carry a single length byte.

use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;

use crate::cipher::{encrypt_buffer, DiscKey};
use crate::error::{DumpError, Result};

/// IRD magic: "3IRD"
pub const IRD_MAGIC: [u8; 4] = *b"3IRD";

/// Disc-key derivation constants published on the PS3 developer wiki: the
/// disc key is the AES-128-CBC encryption of `Data1` under this key/IV pair.
const D1_CIPHER_KEY: DiscKey = [
    0x38, 0x0b, 0xcf, 0x0b, 0x53, 0x45, 0x5b, 0x3c, 0x78, 0x17, 0xab, 0x4f, 0xa3, 0xba, 0x90,
    0xed,
];
const D1_CIPHER_IV: [u8; 16] = [
    0x69, 0x47, 0x47, 0x72, 0xaf, 0x6f, 0xda, 0xb3, 0x42, 0x74, 0x3a, 0xef, 0xaa, 0x18, 0x62,
    0x87,
];

/// Size of the PIC (permanent information and control) area.
const PIC_SIZE: usize = 115;

/// Parsed IRD archive.
#[derive(Debug, Clone)]
pub struct IrdArchive {
    pub version: u8,
    pub product_code: String,
    pub title: String,
    pub update_version: String,
    pub game_version: String,
    pub app_version: String,
    /// (file start sector, MD5) for every file covered by the archive.
    pub file_hashes: Vec<(u64, [u8; 16])>,
    pub data1: [u8; 16],
    pub data2: [u8; 16],
    pub uid: u32,
}

/// Derive the disc key from the archive's `Data1` field.
pub fn disc_key_from_data1(data1: &[u8; 16]) -> DiscKey {
    let mut key = *data1;
    encrypt_buffer(&mut key, &D1_CIPHER_KEY, &D1_CIPHER_IV);
    key
}

/// Read and parse an `.ird` file.
pub fn parse_ird(path: &Path) -> Result<IrdArchive> {
    let compressed = std::fs::read(path)?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut data = Vec::new();
    decoder
        .read_to_end(&mut data)
        .map_err(|err| DumpError::InvalidIrd(format!("not a gzip archive: {err}")))?;
    parse_ird_bytes(&data)
}

/// Parse an already-decompressed IRD image.
pub fn parse_ird_bytes(data: &[u8]) -> Result<IrdArchive> {
    let mut cursor = IrdCursor { data, offset: 0 };

    if cursor.take(4)? != IRD_MAGIC {
        return Err(DumpError::InvalidIrd("bad magic".into()));
    }
    let version = cursor.u8()?;

    let product_code = String::from_utf8_lossy(cursor.take(9)?).to_string();
    let title = cursor.string()?;
    let update_version = cursor.string()?;
    let game_version = cursor.string()?;
    let app_version = cursor.string()?;

    if version == 7 {
        cursor.u32()?; // archive id
    }

    // Gzipped disc header and footer images; not needed for key selection.
    let header_len = cursor.u32()? as usize;
    cursor.take(header_len)?;
    let footer_len = cursor.u32()? as usize;
    cursor.take(footer_len)?;

    let region_count = cursor.u8()? as usize;
    cursor.take(region_count * 16)?;

    let file_count = cursor.u32()? as usize;
    if file_count > 1_000_000 {
        return Err(DumpError::InvalidIrd(format!(
            "implausible file count {file_count}"
        )));
    }
    let mut file_hashes = Vec::with_capacity(file_count);
    for _ in 0..file_count {
        let sector = cursor.u64()?;
        let mut md5 = [0u8; 16];
        md5.copy_from_slice(cursor.take(16)?);
        file_hashes.push((sector, md5));
    }

    cursor.u16()?; // extra config count
    cursor.u16()?; // attachment count

    if version >= 9 {
        cursor.take(PIC_SIZE)?;
    }
    let mut data1 = [0u8; 16];
    data1.copy_from_slice(cursor.take(16)?);
    let mut data2 = [0u8; 16];
    data2.copy_from_slice(cursor.take(16)?);
    if version < 9 {
        cursor.take(PIC_SIZE)?;
    }

    let uid = cursor.u32()?;
    cursor.u32()?; // trailing CRC of the uncompressed image

    Ok(IrdArchive {
        version,
        product_code,
        title,
        update_version,
        game_version,
        app_version,
        file_hashes,
        data1,
        data2,
        uid,
    })
}

struct IrdCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> IrdCursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let slice = self
            .data
            .get(self.offset..self.offset.saturating_add(len))
            .ok_or_else(|| DumpError::InvalidIrd("archive truncated".into()))?;
        self.offset += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Length-prefixed string (single length byte).
    fn string(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        Ok(String::from_utf8_lossy(self.take(len)?).to_string())
    }
}
