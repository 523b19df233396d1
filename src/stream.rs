//! Per-file decryption stream
//!
//! A read-side adapter over the positioned raw device: sector by sector it
//! decrypts encrypted ranges, passes unprotected ranges through untouched,
//! truncates to the file's declared length, and feeds every emitted byte to
//! the active hash set. The stream borrows the device and owns nothing else.

use std::io::{self, Read};

use crate::cipher::{decrypt_buffer, DiscKey};
use crate::device::RawDevice;
use crate::error::DumpError;
use crate::hashes::{HashAlgorithm, MultiHasher};
use crate::sector::{in_regions, SectorRange, SECTOR_SIZE};

/// Hashes and flags collected over one completed copy.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub hashes: Vec<(HashAlgorithm, String)>,
    /// A sector read came back short or failed to decrypt; the copy is
    /// suspect and retrying it is pointless.
    pub last_block_corrupted: bool,
    pub saw_encrypted: bool,
    pub saw_unprotected: bool,
}

impl StreamSummary {
    pub fn digest(&self, algorithm: HashAlgorithm) -> Option<&str> {
        self.hashes
            .iter()
            .find(|(algo, _)| *algo == algorithm)
            .map(|(_, digest)| digest.as_str())
    }
}

/// Decrypting reader over one file's sector span.
pub struct DecryptionStream<'a> {
    device: &'a mut dyn RawDevice,
    key: DiscKey,
    regions: &'a [SectorRange],
    next_sector: u64,
    remaining: u64,
    buf: Box<[u8; SECTOR_SIZE]>,
    buf_pos: usize,
    buf_len: usize,
    hasher: MultiHasher,
    last_block_corrupted: bool,
    saw_encrypted: bool,
    saw_unprotected: bool,
}

impl<'a> DecryptionStream<'a> {
    pub fn new(
        device: &'a mut dyn RawDevice,
        key: DiscKey,
        start_sector: u64,
        length: u64,
        regions: &'a [SectorRange],
        extra_hashes: &[HashAlgorithm],
    ) -> Self {
        Self {
            device,
            key,
            regions,
            next_sector: start_sector,
            remaining: length,
            buf: Box::new([0u8; SECTOR_SIZE]),
            buf_pos: 0,
            buf_len: 0,
            hasher: MultiHasher::new(extra_hashes),
            last_block_corrupted: false,
            saw_encrypted: false,
            saw_unprotected: false,
        }
    }

    /// Sector the next read will pull from; monotone over the stream's life.
    pub fn sector_position(&self) -> u64 {
        self.next_sector
    }

    /// Finalize the hashes after the copy is done.
    pub fn finish(self) -> StreamSummary {
        StreamSummary {
            hashes: self.hasher.finalize(),
            last_block_corrupted: self.last_block_corrupted,
            saw_encrypted: self.saw_encrypted,
            saw_unprotected: self.saw_unprotected,
        }
    }

    /// Pull in and process the next sector of the file.
    fn fill_next_sector(&mut self) -> io::Result<()> {
        let sector = self.next_sector;
        let want = (self.remaining).min(SECTOR_SIZE as u64) as usize;

        let n = self
            .device
            .read_sector_into(sector, &mut self.buf)
            .map_err(into_io)?;
        if n < want {
            self.last_block_corrupted = true;
            self.buf[n..].fill(0);
        }

        if in_regions(self.regions, sector) {
            // The drive already returned plaintext; decrypting again would
            // corrupt it.
            self.saw_unprotected = true;
        } else {
            let iv = self.device.sector_iv(sector).map_err(into_io)?;
            decrypt_buffer(&mut self.buf[..], &self.key, &iv);
            self.saw_encrypted = true;
        }

        self.hasher.update(&self.buf[..want]);
        self.buf_pos = 0;
        self.buf_len = want;
        self.remaining -= want as u64;
        self.next_sector += 1;
        Ok(())
    }
}

fn into_io(err: DumpError) -> io::Error {
    match err {
        DumpError::Io(io) => io,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl Read for DecryptionStream<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.buf_pos == self.buf_len {
            if self.remaining == 0 {
                return Ok(0);
            }
            self.fill_next_sector()?;
        }

        let n = out.len().min(self.buf_len - self.buf_pos);
        out[..n].copy_from_slice(&self.buf[self.buf_pos..self.buf_pos + n]);
        self.buf_pos += n;
        Ok(n)
    }
}
