//! Raw block-device access and disc crypto helpers
//!
//! The engine reads encrypted sectors straight from the block device. The
//! device interface also supplies the two disc-crypto inputs the cipher
//! treats as opaque: the per-sector IV and the unprotected-region map.
//! Both are derived from the disc itself — the IV from the sector number,
//! the region map from the region table in sector 0 (alternating
//! plain/encrypted ranges, first range plain, end sectors inclusive).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{DumpError, Result};
use crate::iso::ReadSeek;
use crate::sector::{SectorRange, SECTOR_SIZE};

/// Read-side view of the raw disc plus its crypto helpers.
pub trait RawDevice: Read + Seek + Send {
    /// 16-byte CBC initialization vector for sector `n`.
    fn sector_iv(&mut self, sector: u64) -> Result<[u8; 16]>;

    /// Ordered sector ranges the drive delivers as plaintext.
    fn unprotected_regions(&mut self) -> Result<Vec<SectorRange>>;

    /// Read one whole sector into `buf`, returning the byte count actually
    /// read (short at end of device).
    fn read_sector_into(&mut self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<usize> {
        self.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
        let mut total = 0;
        while total < buf.len() {
            let n = self.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }
}

/// Derive the CBC IV for a sector: the sector number as a big-endian u32 in
/// the last four bytes of an otherwise zero IV.
pub fn sector_iv(sector: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[12..16].copy_from_slice(&(sector as u32).to_be_bytes());
    iv
}

/// Parse the sector-0 region table into the unprotected (plaintext) ranges.
///
/// Layout: big-endian count of plain regions at offset 0; region end sectors
/// (inclusive) from offset 12, one per region, alternating plain/encrypted
/// starting with plain. Total regions = plain_count * 2 - 1.
pub fn parse_unprotected_regions(header: &[u8]) -> Result<Vec<SectorRange>> {
    if header.len() < 16 {
        return Err(DumpError::InvalidDisc("region table truncated".into()));
    }

    let plain_count = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if plain_count == 0 || plain_count > 256 {
        return Err(DumpError::InvalidDisc(format!(
            "implausible region count {plain_count}"
        )));
    }
    let region_count = plain_count as usize * 2 - 1;

    let mut regions = Vec::with_capacity(plain_count as usize);
    let mut offset = 12;
    let mut start = 0u64;
    let mut encrypted = false;
    for _ in 0..region_count {
        let raw = header
            .get(offset..offset + 4)
            .ok_or_else(|| DumpError::InvalidDisc("region table truncated".into()))?;
        let end = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64;
        if !encrypted {
            // Inclusive end sector, converted to a half-open range.
            regions.push(SectorRange::new(start, end + 1));
        }
        start = end + 1;
        encrypted = !encrypted;
        offset += 4;
    }

    Ok(regions)
}

/// File-backed raw disc: a physical block device or a disc image.
pub struct RawDisc {
    source: Box<dyn ReadSeek>,
    regions: Option<Vec<SectorRange>>,
}

impl RawDisc {
    /// Open a raw device path (`/dev/sr0`, `\\.\CDROM0`) or an image file.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_source(Box::new(File::open(path)?)))
    }

    /// Wrap an already-open byte source.
    pub fn from_source(source: Box<dyn ReadSeek>) -> Self {
        Self {
            source,
            regions: None,
        }
    }
}

impl Read for RawDisc {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.source.read(buf)
    }
}

impl Seek for RawDisc {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.source.seek(pos)
    }
}

impl RawDevice for RawDisc {
    fn sector_iv(&mut self, sector: u64) -> Result<[u8; 16]> {
        Ok(sector_iv(sector))
    }

    fn unprotected_regions(&mut self) -> Result<Vec<SectorRange>> {
        if let Some(regions) = &self.regions {
            return Ok(regions.clone());
        }

        let pos = self.source.stream_position()?;
        self.source.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; SECTOR_SIZE];
        self.source.read_exact(&mut header)?;
        self.source.seek(SeekFrom::Start(pos))?;

        let regions = parse_unprotected_regions(&header)?;
        self.regions = Some(regions.clone());
        Ok(regions)
    }
}
