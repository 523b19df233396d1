//! Known-plaintext detection probe and key selection
//!
//! A candidate key is accepted when decrypting the probe sector reproduces
//! the expected plaintext prefix of a well-known file. The fan-out over
//! untested keys is embarrassingly parallel; the cipher is pure, so workers
//! share nothing.

use std::collections::HashSet;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::cipher::{decrypt_buffer, DiscKey};
use crate::device::RawDevice;
use crate::error::{DumpError, Result};
use crate::iso::IsoFilesystem;
use crate::keys::{KeyIndex, KeyRecord, KeySource};
use crate::sector::SECTOR_SIZE;

/// Detection-probe files in priority order, with their plaintext prefixes.
pub const DETECTION_FILES: &[(&str, &[u8])] = &[
    ("\\PS3_GAME\\LICDIR\\LIC.DAT", b"PS3LICDA"),
    (
        "\\PS3_GAME\\USRDIR\\EBOOT.BIN",
        &[b'S', b'C', b'E', 0x00, 0x00, 0x00, 0x00, 0x02],
    ),
];

/// Known-plaintext probe: one encrypted sector plus what its head must
/// decrypt to.
#[derive(Debug, Clone)]
pub struct DetectionProbe {
    pub sector: u64,
    pub expected_prefix: Vec<u8>,
    pub iv: [u8; 16],
    /// Raw ciphertext of the probe sector, captured once so each candidate
    /// key decrypts a private copy.
    pub ciphertext: Vec<u8>,
}

/// Build the probe from the first detection file that exists with non-zero
/// length.
pub fn build_probe(
    fs: &dyn IsoFilesystem,
    device: &mut dyn RawDevice,
) -> Result<DetectionProbe> {
    for (path, prefix) in DETECTION_FILES {
        if !fs.file_exists(path) {
            continue;
        }
        let record = match fs.file_record(path) {
            Ok(record) => record,
            Err(err) => {
                debug!(path, %err, "detection file unreadable");
                continue;
            }
        };
        if record.length == 0 {
            debug!(path, "detection file is empty");
            continue;
        }

        let sector = record.start_sector;
        let iv = device.sector_iv(sector)?;
        let mut buf = [0u8; SECTOR_SIZE];
        let n = device.read_sector_into(sector, &mut buf)?;
        if n < prefix.len() {
            continue;
        }
        debug!(path, sector, "detection probe built");
        return Ok(DetectionProbe {
            sector,
            expected_prefix: prefix.to_vec(),
            iv,
            ciphertext: buf[..n].to_vec(),
        });
    }
    Err(DumpError::DetectionFileMissing)
}

/// The key chosen for the dump, plus the record carrying its metadata.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub key_id: String,
    pub key: DiscKey,
    /// Preferred carrier record of the chosen key group; its source decides
    /// which reference metadata feeds validation.
    pub record: KeyRecord,
}

/// Probe every untested key and choose the unique match.
///
/// All probed ids are marked tested regardless of outcome. When several ids
/// match (the same key under different ids), the first in enumeration order
/// wins with a warning.
pub fn select_key(
    index: &KeyIndex,
    probe: &DetectionProbe,
    tested: &mut HashSet<String>,
    product_code: &str,
    cancel: &CancellationToken,
) -> Result<SelectedKey> {
    let untested: Vec<String> = index
        .key_ids()
        .into_iter()
        .filter(|id| !tested.contains(id))
        .collect();
    if untested.is_empty() {
        return Err(DumpError::NoKey);
    }

    let matches: Vec<String> = untested
        .par_iter()
        .filter_map(|id| {
            if cancel.is_cancelled() {
                return None;
            }
            let group = index.group(id);
            let record = group.first()?;
            key_matches_probe(&record.key, probe).then(|| id.clone())
        })
        .collect();

    cancel.check()?;
    tested.extend(untested.iter().cloned());

    let chosen_id = match matches.as_slice() {
        [] => return Err(DumpError::NoMatch),
        [only] => only.clone(),
        multiple => {
            warn!(
                ids = ?multiple,
                "multiple key ids decrypt the probe, choosing the first"
            );
            multiple[0].clone()
        }
    };

    let group = index.group(&chosen_id);
    let record = prefer_record(&group, product_code).clone();
    debug!(key_id = %chosen_id, source = ?record.source, "key selected");
    Ok(SelectedKey {
        key_id: chosen_id,
        key: record.key,
        record,
    })
}

fn key_matches_probe(key: &DiscKey, probe: &DetectionProbe) -> bool {
    let mut plain = probe.ciphertext.clone();
    decrypt_buffer(&mut plain, key, &probe.iv);
    plain.starts_with(&probe.expected_prefix)
}

/// Within a key group, prefer an IRD named after the product code, then any
/// IRD, then the first record.
fn prefer_record<'a>(group: &'a [KeyRecord], product_code: &str) -> &'a KeyRecord {
    let code = product_code.to_ascii_lowercase();
    group
        .iter()
        .find(|record| {
            record.source == KeySource::Ird
                && record.source_path.file_name().is_some_and(|name| {
                    name.to_string_lossy().to_ascii_lowercase().contains(&code)
                })
        })
        .or_else(|| group.iter().find(|record| record.source == KeySource::Ird))
        .unwrap_or(&group[0])
}
