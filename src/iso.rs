//! ISO-9660 reader contract and filesystem records
//!
//! The low-level ISO-9660 reader is an external collaborator: the engine only
//! consumes the contract below. Hosts plug in a real reader through
//! [`IsoOpener`]; tests use in-memory fakes.

use std::io::{Read, Seek};
use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::Result;
use crate::sector::SectorRange;

/// A positioned byte source an ISO reader can be opened over.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// One file on the disc, as reported by the ISO reader.
///
/// `source_path` is disc-relative and backslash-delimited (`\PS3_GAME\...`);
/// it is converted to a host path only at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub source_path: String,
    pub start_sector: u64,
    pub length: u64,
    pub created: Option<SystemTime>,
    pub modified: Option<SystemTime>,
}

/// One directory on the disc, empty directories included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub source_path: String,
    pub created: Option<SystemTime>,
    pub modified: Option<SystemTime>,
}

/// Full directory enumeration of a disc.
#[derive(Debug, Clone, Default)]
pub struct DiscContents {
    pub files: Vec<FileRecord>,
    pub dirs: Vec<DirRecord>,
}

impl DiscContents {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }
}

/// Read-side contract of the external ISO-9660 reader.
pub trait IsoFilesystem: Send {
    /// Logical sector size reported by the volume descriptor.
    fn sector_size(&self) -> u64;

    /// Total sector count of the volume.
    fn total_sectors(&self) -> u64;

    fn file_exists(&self, path: &str) -> bool;

    /// Cluster extents of a file, in read order.
    fn file_clusters(&self, path: &str) -> Result<Vec<SectorRange>>;

    fn file_record(&self, path: &str) -> Result<FileRecord>;

    /// Enumerate every file and directory on the volume.
    fn contents(&self) -> Result<DiscContents>;
}

/// Constructs an [`IsoFilesystem`] over an arbitrary byte source.
///
/// Called once per candidate raw device during identification and once over
/// the cached device prefix when dumping.
pub trait IsoOpener: Send + Sync {
    fn open(&self, source: Box<dyn ReadSeek>) -> Result<Box<dyn IsoFilesystem>>;
}

/// Convert a disc-relative backslash path into a host-relative path.
pub fn host_relative_path(source_path: &str) -> PathBuf {
    source_path
        .trim_start_matches('\\')
        .split('\\')
        .filter(|part| !part.is_empty())
        .collect()
}
