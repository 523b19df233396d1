//! Dump controller and reference-hash validation
//!
//! The controller copies every file off the raw device through a
//! [`DecryptionStream`], retries once on a fresh hash mismatch, restores
//! timestamps, and accumulates per-file failures without aborting the run.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use filetime::FileTime;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::cipher::DiscKey;
use crate::device::RawDevice;
use crate::error::Result;
use crate::hashes::{digests_match, HashAlgorithm};
use crate::iso::{host_relative_path, DiscContents, FileRecord};
use crate::keys::{KeyRecord, KeySource};
use crate::sector::{sectors_for, SectorRange};
use crate::stream::DecryptionStream;

/// Copy chunk size; cancellation is polled at least once per chunk.
const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Headroom demanded on the destination volume beyond the disc payload.
const FREE_SPACE_MARGIN: u64 = 100 * 1024;

/// Copy attempts per file.
const MAX_ATTEMPTS: u32 = 2;

/// Overall verdict of a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum ValidationStatus {
    /// Every verified file matched its reference.
    #[default]
    Ok,
    /// At least one file had no reference to check against.
    Unknown,
    /// A hard failure or an unresolvable hash mismatch occurred.
    Failed,
}

impl ValidationStatus {
    /// Ok → Unknown; Failed stays Failed.
    fn downgrade(&mut self) {
        if *self == ValidationStatus::Ok {
            *self = ValidationStatus::Unknown;
        }
    }

    fn fail(&mut self) {
        *self = ValidationStatus::Failed;
    }
}

/// Why a file ended up in `broken_files`.
pub mod broken_reason {
    pub const MISSING: &str = "missing";
    pub const CORRUPTED: &str = "corrupted";
    pub const READ_FAILED: &str = "failed to read";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokenFile {
    pub path: String,
    pub reason: String,
}

/// Host-observable dump state; mutated only by the controller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Progress {
    pub current_file: usize,
    pub total_files: usize,
    pub current_sector: u64,
    pub total_sectors: u64,
    pub validation_status: ValidationStatus,
    pub broken_files: Vec<BrokenFile>,
}

/// Completion report of one dump invocation.
#[derive(Debug, Clone, Serialize)]
pub struct DumpReport {
    pub output_dir: PathBuf,
    pub files_copied: usize,
    pub validation_status: ValidationStatus,
    pub broken_files: Vec<BrokenFile>,
    pub cancelled: bool,
}

/// Per-file verdict under the reference match rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Verified,
    Mismatch,
    NoReference,
}

/// Reference hashes joined from the matching key records.
///
/// Records contribute only when they come from an IRD whose game version
/// equals the disc version; their (sector, MD5) pairs are resolved to paths
/// through the filesystem records.
#[derive(Debug, Default)]
pub struct Validator {
    references: HashMap<String, Vec<(HashAlgorithm, String)>>,
}

impl Validator {
    pub fn from_records(
        records: &[KeyRecord],
        disc_version: &str,
        files: &[FileRecord],
    ) -> Self {
        let by_sector: HashMap<u64, &str> = files
            .iter()
            .map(|f| (f.start_sector, f.source_path.as_str()))
            .collect();

        let mut references: HashMap<String, Vec<(HashAlgorithm, String)>> = HashMap::new();
        for record in records {
            if record.source != KeySource::Ird {
                continue;
            }
            if record.game_version.as_deref() != Some(disc_version) {
                debug!(
                    path = %record.source_path.display(),
                    version = ?record.game_version,
                    "reference skipped, game version differs"
                );
                continue;
            }
            for (sector, md5) in &record.file_hashes {
                if let Some(path) = by_sector.get(sector) {
                    references
                        .entry((*path).to_string())
                        .or_default()
                        .push((HashAlgorithm::Md5, hex::encode(md5)));
                }
            }
        }
        Self { references }
    }

    /// True if any file has a reference at all.
    pub fn has_references(&self) -> bool {
        !self.references.is_empty()
    }

    /// Algorithms beyond MD5 the stream must compute for this file.
    pub fn extra_algorithms(&self, path: &str) -> Vec<HashAlgorithm> {
        let mut extra: Vec<HashAlgorithm> = self
            .references
            .get(path)
            .into_iter()
            .flatten()
            .map(|(algo, _)| *algo)
            .filter(|algo| *algo != HashAlgorithm::Md5)
            .collect();
        extra.sort();
        extra.dedup();
        extra
    }

    /// Match rule: one equal (algorithm, digest) pair across any reference
    /// record verifies the file.
    pub fn verify(&self, path: &str, computed: &[(HashAlgorithm, String)]) -> Verdict {
        let Some(expected) = self.references.get(path) else {
            return Verdict::NoReference;
        };
        let matched = expected.iter().any(|(algo, digest)| {
            computed
                .iter()
                .any(|(got_algo, got)| got_algo == algo && digests_match(got, digest))
        });
        if matched {
            Verdict::Verified
        } else {
            Verdict::Mismatch
        }
    }
}

/// Everything one dump invocation needs.
pub(crate) struct DumpJob<'a> {
    pub device: &'a mut dyn RawDevice,
    pub contents: &'a DiscContents,
    pub regions: &'a [SectorRange],
    pub key: DiscKey,
    pub validator: &'a Validator,
    /// Disc-relative paths present on the mount; `None` skips presence checks.
    pub mount_files: Option<&'a HashSet<String>>,
    pub output_dir: &'a Path,
    pub progress: &'a Mutex<Progress>,
    pub cancel: &'a CancellationToken,
}

/// Run the per-file copy sequence. Per-file failures accumulate; only
/// cancellation stops the loop early.
pub(crate) fn run_dump(job: DumpJob) -> Result<DumpReport> {
    let DumpJob {
        device,
        contents,
        regions,
        key,
        validator,
        mount_files,
        output_dir,
        progress,
        cancel,
    } = job;

    let total_bytes = contents.total_bytes();
    let total_sectors: u64 = contents.files.iter().map(|f| sectors_for(f.length)).sum();
    {
        let mut p = progress.lock().unwrap();
        p.total_files = contents.files.len();
        p.total_sectors = total_sectors;
    }

    // The templated directory may not exist yet; probe its parent then.
    let space = available_space(output_dir)
        .or_else(|| output_dir.parent().and_then(available_space));
    if let Some(free) = space {
        if free < total_bytes + FREE_SPACE_MARGIN {
            warn!(free, needed = total_bytes, "destination volume may be too small");
        }
    }

    materialize_directories(output_dir, contents)?;

    let mut files_copied = 0usize;
    let mut sectors_done = 0u64;
    let mut cancelled = false;

    for (index, file) in contents.files.iter().enumerate() {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        progress.lock().unwrap().current_file = index + 1;

        if let Some(present) = mount_files {
            if !present.contains(&file.source_path) {
                warn!(path = %file.source_path, "file absent on the mount");
                record_broken(progress, file, broken_reason::MISSING);
                progress.lock().unwrap().validation_status.downgrade();
                sectors_done += sectors_for(file.length);
                continue;
            }
        }

        let target = output_dir.join(host_relative_path(&file.source_path));
        match copy_file(
            device, file, regions, key, validator, &target, progress, sectors_done, cancel,
        ) {
            Ok(FileOutcome::Copied) => {
                files_copied += 1;
                restore_file_times(&target, file.created, file.modified);
            }
            Ok(FileOutcome::Cancelled) => {
                // Partial output is left in place; the run ends cleanly.
                cancelled = true;
                break;
            }
            Err(err) => {
                warn!(path = %file.source_path, %err, "file unreadable after retries");
                record_broken(progress, file, broken_reason::READ_FAILED);
                progress.lock().unwrap().validation_status.fail();
            }
        }

        sectors_done += sectors_for(file.length);
        progress.lock().unwrap().current_sector = sectors_done;
    }

    if !cancelled {
        restore_directory_times(output_dir, contents);
    }

    let p = progress.lock().unwrap();
    let report = DumpReport {
        output_dir: output_dir.to_path_buf(),
        files_copied,
        validation_status: p.validation_status,
        broken_files: p.broken_files.clone(),
        cancelled,
    };
    info!(
        files = report.files_copied,
        broken = report.broken_files.len(),
        status = ?report.validation_status,
        cancelled,
        "dump finished"
    );
    Ok(report)
}

enum FileOutcome {
    Copied,
    Cancelled,
}

/// Copy one file with up to [`MAX_ATTEMPTS`] tries.
#[allow(clippy::too_many_arguments)]
fn copy_file(
    device: &mut dyn RawDevice,
    file: &FileRecord,
    regions: &[SectorRange],
    key: DiscKey,
    validator: &Validator,
    target: &Path,
    progress: &Mutex<Progress>,
    sectors_base: u64,
    cancel: &CancellationToken,
) -> io::Result<FileOutcome> {
    let extra = validator.extra_algorithms(&file.source_path);
    let mut previous_md5: Option<String> = None;
    let mut last_error: Option<io::Error> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            return Ok(FileOutcome::Cancelled);
        }

        let mut stream = DecryptionStream::new(
            device,
            key,
            file.start_sector,
            file.length,
            regions,
            &extra,
        );
        let mut out = BufWriter::new(File::create(target)?);

        let copy_result = (|| -> io::Result<bool> {
            loop {
                if cancel.is_cancelled() {
                    return Ok(false);
                }
                let n = io::copy(&mut (&mut stream).take(CHUNK_SIZE), &mut out)?;
                progress.lock().unwrap().current_sector =
                    sectors_base + (stream.sector_position() - file.start_sector);
                if n == 0 {
                    return Ok(true);
                }
            }
        })();

        match copy_result {
            Ok(false) => return Ok(FileOutcome::Cancelled),
            Ok(true) => {}
            Err(err) => {
                warn!(path = %file.source_path, attempt, %err, "copy attempt failed");
                last_error = Some(err);
                continue;
            }
        }
        out.flush()?;
        drop(out);

        let summary = stream.finish();
        match validator.verify(&file.source_path, &summary.hashes) {
            Verdict::NoReference => {
                progress.lock().unwrap().validation_status.downgrade();
                return Ok(FileOutcome::Copied);
            }
            Verdict::Verified => return Ok(FileOutcome::Copied),
            Verdict::Mismatch => {
                let md5 = summary
                    .digest(HashAlgorithm::Md5)
                    .unwrap_or_default()
                    .to_string();
                let repeated = previous_md5.as_deref() == Some(md5.as_str());
                if summary.last_block_corrupted || repeated || attempt == MAX_ATTEMPTS {
                    warn!(
                        path = %file.source_path,
                        corrupted = summary.last_block_corrupted,
                        repeated,
                        "hash mismatch, giving up"
                    );
                    record_broken_path(progress, &file.source_path, broken_reason::CORRUPTED);
                    progress.lock().unwrap().validation_status.fail();
                    return Ok(FileOutcome::Copied);
                }
                warn!(path = %file.source_path, %md5, "hash mismatch, retrying");
                previous_md5 = Some(md5);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "retries exhausted")))
}

fn record_broken(progress: &Mutex<Progress>, file: &FileRecord, reason: &str) {
    record_broken_path(progress, &file.source_path, reason);
}

fn record_broken_path(progress: &Mutex<Progress>, path: &str, reason: &str) {
    progress.lock().unwrap().broken_files.push(BrokenFile {
        path: path.to_string(),
        reason: reason.to_string(),
    });
}

/// Create the whole output tree up front, empty directories included.
fn materialize_directories(output_dir: &Path, contents: &DiscContents) -> Result<()> {
    fs::create_dir_all(output_dir)?;
    for dir in &contents.dirs {
        fs::create_dir_all(output_dir.join(host_relative_path(&dir.source_path)))?;
    }
    for file in &contents.files {
        if let Some(parent) = output_dir.join(host_relative_path(&file.source_path)).parent() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn restore_file_times(path: &Path, created: Option<SystemTime>, modified: Option<SystemTime>) {
    let Some(mtime) = modified.or(created) else {
        return;
    };
    let atime = created.unwrap_or(mtime);
    if let Err(err) = filetime::set_file_times(
        path,
        FileTime::from_system_time(atime),
        FileTime::from_system_time(mtime),
    ) {
        warn!(path = %path.display(), %err, "cannot restore file times");
    }
}

/// Directory mtimes drift while children are written, so they are restored
/// last, deepest first (reverse lexical order keeps children before parents).
fn restore_directory_times(output_dir: &Path, contents: &DiscContents) {
    let mut dirs: Vec<_> = contents.dirs.iter().collect();
    dirs.sort_by(|a, b| b.source_path.cmp(&a.source_path));
    for dir in dirs {
        let path = output_dir.join(host_relative_path(&dir.source_path));
        restore_file_times(&path, dir.created, dir.modified);
    }
}

#[cfg(unix)]
fn available_space(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: statvfs only writes into the buffer we hand it.
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } == 0 {
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn available_space(_path: &Path) -> Option<u64> {
    None
}
