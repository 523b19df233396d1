//! Key-material ingestion and the engine-owned key index
//!
//! Two providers feed the index from a local cache directory: IRD archives
//! and redump key dumps. Provider order is fixed (IRD first) so IRD records,
//! which carry reference hashes, sort ahead of redump records sharing the
//! same key id.

pub mod ird;
pub mod redump;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::cipher::DiscKey;
use crate::error::Result;

/// Which provider a key record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeySource {
    Ird,
    Redump,
}

/// One decryption-key candidate from the cache.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub key: DiscKey,
    /// Lowercase hex of `key`; records sharing an id are grouped.
    pub key_id: String,
    pub source: KeySource,
    pub source_path: PathBuf,
    /// Game version the record's reference hashes apply to (IRD only).
    pub game_version: Option<String>,
    /// Reference records of (file start sector, MD5). Empty for redump keys.
    pub file_hashes: Vec<(u64, [u8; 16])>,
}

impl KeyRecord {
    fn new(key: DiscKey, source: KeySource, source_path: PathBuf) -> Self {
        Self {
            key_id: hex::encode(key),
            key,
            source,
            source_path,
            game_version: None,
            file_hashes: Vec::new(),
        }
    }
}

/// Engine-owned index of every known key, grouped by key id.
///
/// Insertions happen under one exclusive lock per provider batch; the BTreeMap
/// keeps enumeration order stable (lexical by key id) across runs.
#[derive(Default)]
pub struct KeyIndex {
    groups: Mutex<BTreeMap<String, Vec<KeyRecord>>>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one provider's worth of records under a single lock.
    pub fn insert_batch(&self, records: Vec<KeyRecord>) {
        let mut groups = self.groups.lock().unwrap();
        for record in records {
            groups.entry(record.key_id.clone()).or_default().push(record);
        }
    }

    /// All key ids, in enumeration (lexical) order.
    pub fn key_ids(&self) -> Vec<String> {
        self.groups.lock().unwrap().keys().cloned().collect()
    }

    /// All records sharing `key_id`, in insertion order.
    pub fn group(&self, key_id: &str) -> Vec<KeyRecord> {
        self.groups
            .lock()
            .unwrap()
            .get(key_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.groups.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run both providers over the cache directory in fixed order.
///
/// Each provider's batch is inserted only after the provider completes, so a
/// cancellation observed mid-scan leaves the index exactly as it was before
/// the provider call.
pub fn load_key_cache(
    index: &KeyIndex,
    cache_dir: &Path,
    product_code: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let batch = enumerate_ird_keys(cache_dir, product_code, cancel)?;
    debug!(count = batch.len(), "IRD provider finished");
    index.insert_batch(batch);

    let batch = enumerate_redump_keys(cache_dir, cancel)?;
    debug!(count = batch.len(), "redump provider finished");
    index.insert_batch(batch);

    Ok(())
}

/// Scan the cache tree for `.ird` archives.
///
/// A file that fails to parse is logged and skipped; only cancellation aborts
/// the scan.
pub fn enumerate_ird_keys(
    cache_dir: &Path,
    product_code: &str,
    cancel: &CancellationToken,
) -> Result<Vec<KeyRecord>> {
    let mut records = Vec::new();
    for path in files_with_extensions(cache_dir, &["ird"]) {
        cancel.check()?;
        match ird::parse_ird(&path) {
            Ok(archive) => {
                if !archive.product_code.eq_ignore_ascii_case(product_code) {
                    debug!(
                        path = %path.display(),
                        ird_product = %archive.product_code,
                        "IRD is for a different product code"
                    );
                }
                let key = ird::disc_key_from_data1(&archive.data1);
                let mut record = KeyRecord::new(key, KeySource::Ird, path);
                record.game_version = Some(archive.game_version);
                record.file_hashes = archive.file_hashes;
                records.push(record);
            }
            Err(err) => warn!(path = %path.display(), %err, "skipping unreadable IRD"),
        }
    }
    Ok(records)
}

/// Scan the cache tree for flat key dumps (`.dkey` / `.key`).
pub fn enumerate_redump_keys(
    cache_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<KeyRecord>> {
    let mut records = Vec::new();
    for path in files_with_extensions(cache_dir, &["dkey", "key"]) {
        cancel.check()?;
        match redump::parse_key_file(&path) {
            Ok(key) => records.push(KeyRecord::new(key, KeySource::Redump, path)),
            Err(err) => warn!(path = %path.display(), %err, "skipping unreadable key dump"),
        }
    }
    Ok(records)
}

/// Recursively collect files whose extension matches (case-insensitive),
/// sorted for stable enumeration order.
fn files_with_extensions(root: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %dir.display(), %err, "cannot read cache directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                if extensions.iter().any(|want| ext.eq_ignore_ascii_case(want)) {
                    found.push(path);
                }
            }
        }
    }
    found.sort();
    found
}
