//! Disc identification and output naming
//!
//! Identification reads the on-disc manifests through the mount, then matches
//! the mounted disc to a raw block device by comparing `PS3_DISC.SFB` bytes
//! read both ways.

use std::fs::{self, File};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::device::{RawDevice, RawDisc};
use crate::drives;
use crate::error::{DumpError, Result};
use crate::iso::IsoOpener;
use crate::sector::{SectorRange, SECTOR_SIZE};
use crate::sfb::DiscSfb;
use crate::sfo::ParamSfo;

/// Default output-directory template.
pub const DEFAULT_TEMPLATE: &str = "[{product_code}] {title}";

/// Identity of a disc, immutable after identification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscIdentity {
    pub title: String,
    /// 9-character product code (`AAAA#####`).
    pub product_code: String,
    pub disc_version: String,
    pub app_version: String,
}

impl DiscIdentity {
    /// Region derived from the third character of the product code.
    pub fn region(&self) -> &'static str {
        region_for_product_code(&self.product_code)
    }
}

/// Region lookup over `product_code[2]`; unknown letters yield the empty
/// string.
pub fn region_for_product_code(code: &str) -> &'static str {
    match code.as_bytes().get(2) {
        Some(b'A') => "ASIA",
        Some(b'E') => "EU",
        Some(b'H') => "HK",
        Some(b'J') | Some(b'P') | Some(b'T') => "JP",
        Some(b'K') => "KR",
        Some(b'U') => "US",
        _ => "",
    }
}

/// Collapse an over-long TITLE_ID (`BLES-01234`) to the 9-character product
/// code: first four plus last five characters.
pub fn normalize_title_id(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    if chars.len() <= 9 {
        return raw.to_string();
    }
    chars[..4]
        .iter()
        .chain(chars[chars.len() - 5..].iter())
        .collect()
}

/// Render the output-directory name from a template.
///
/// Recognized placeholders: `{product_code}`, `{product_code_letters}`,
/// `{product_code_numbers}`, `{title}`, `{region}`. Characters forbidden in
/// host paths are stripped and every segment is right-trimmed of `.`; a name
/// that sanitizes to nothing falls back to `unknown-<product_code>`.
pub fn output_dir_name(template: &str, identity: &DiscIdentity) -> String {
    let code = &identity.product_code;
    let letters: String = code.chars().take(4).collect();
    let numbers: String = code
        .chars()
        .skip(code.chars().count().saturating_sub(5))
        .collect();

    let rendered = template
        .replace("{product_code}", code)
        .replace("{product_code_letters}", &letters)
        .replace("{product_code_numbers}", &numbers)
        .replace("{title}", &identity.title)
        .replace("{region}", identity.region());

    let sanitized = sanitize_output_path(&rendered);
    if sanitized.is_empty() {
        format!("unknown-{code}")
    } else {
        sanitized
    }
}

/// Characters no host filesystem accepts in a path segment.
const FORBIDDEN: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

fn sanitize_output_path(raw: &str) -> String {
    raw.split(['/', '\\'])
        .map(|segment| {
            segment
                .chars()
                .filter(|c| !FORBIDDEN.contains(c) && !c.is_control())
                .collect::<String>()
                .trim()
                .trim_end_matches('.')
                .to_string()
        })
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Result of identifying the mounted disc.
#[derive(Debug, Clone)]
pub struct DetectedDisc {
    pub identity: DiscIdentity,
    /// Mount root the manifests were read from.
    pub input_root: PathBuf,
    /// Rendered and sanitized output directory name.
    pub output_name: String,
    /// Disc-relative (backslash) paths and sizes of every file on the mount.
    pub mount_files: Vec<(String, u64)>,
    /// Raw bytes of the mount's `PS3_DISC.SFB`, kept for device matching.
    pub sfb_bytes: Vec<u8>,
}

/// Identify the disc: use `input_dir` when supplied, otherwise probe every
/// mounted candidate for a root `PS3_DISC.SFB` (first match wins).
pub fn detect_disc(input_dir: Option<&Path>, template: Option<&str>) -> Result<DetectedDisc> {
    let root = match input_dir {
        Some(dir) => dir.to_path_buf(),
        None => drives::mounted_candidates()
            .into_iter()
            .find(|candidate| candidate.join("PS3_DISC.SFB").is_file())
            .ok_or(DumpError::DiscNotFound)?,
    };
    identify_mount(&root, template)
}

/// Identify a disc mounted at `root`.
pub fn identify_mount(root: &Path, template: Option<&str>) -> Result<DetectedDisc> {
    let sfb_path = root.join("PS3_DISC.SFB");
    if !sfb_path.is_file() {
        return Err(DumpError::DiscNotFound);
    }
    let sfb_bytes = fs::read(&sfb_path)?;
    let sfb = DiscSfb::parse(&sfb_bytes)?;

    match sfb.hybrid_flags() {
        Some(flags) if flags.contains('g') => {}
        flags => warn!(?flags, "HYBRID_FLAG does not mark a game disc"),
    }
    let sfb_title_id = sfb.title_id().map(normalize_title_id);

    let sfo_path = root.join("PS3_GAME").join("PARAM.SFO");
    let sfo_data = fs::read(&sfo_path)
        .map_err(|_| DumpError::InvalidDisc("PS3_GAME/PARAM.SFO missing".into()))?;
    let sfo = ParamSfo::parse(&sfo_data)
        .map_err(|err| DumpError::InvalidDisc(format!("PARAM.SFO unreadable: {err}")))?;

    let sfo_title_id = sfo
        .string_value("TITLE_ID")
        .map(|id| normalize_title_id(&id));
    if let (Some(a), Some(b)) = (&sfb_title_id, &sfo_title_id) {
        if a != b {
            warn!(sfb = %a, sfo = %b, "TITLE_ID mismatch between SFB and SFO");
        }
    }

    let product_code = sfb_title_id
        .or(sfo_title_id)
        .ok_or_else(|| DumpError::InvalidDisc("disc carries no TITLE_ID".into()))?;

    let identity = DiscIdentity {
        title: sfo.string_value("TITLE").unwrap_or_default(),
        product_code,
        disc_version: sfo.string_value("VERSION").unwrap_or_default(),
        app_version: sfo.string_value("APP_VER").unwrap_or_default(),
    };

    let mount_files = walk_mount(root)?;
    let output_name = output_dir_name(template.unwrap_or(DEFAULT_TEMPLATE), &identity);
    debug!(
        title = %identity.title,
        product_code = %identity.product_code,
        files = mount_files.len(),
        "disc identified"
    );

    Ok(DetectedDisc {
        identity,
        input_root: root.to_path_buf(),
        output_name,
        mount_files,
        sfb_bytes,
    })
}

/// Enumerate every file under the mount as (disc-relative backslash path,
/// size), sorted by path.
fn walk_mount(root: &Path) -> Result<Vec<(String, u64)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let meta = entry.metadata()?;
                files.push((disc_relative(root, &path), meta.len()));
            }
        }
    }
    files.sort();
    Ok(files)
}

fn disc_relative(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut out = String::new();
    for part in rel.components() {
        out.push('\\');
        out.push_str(&part.as_os_str().to_string_lossy());
    }
    out
}

/// Find the raw device whose `PS3_DISC.SFB` bytes equal the mount's copy.
pub fn match_physical_device(
    opener: &dyn IsoOpener,
    devices: &[PathBuf],
    mount_sfb: &[u8],
) -> Result<PathBuf> {
    for path in devices {
        match sfb_bytes_from_device(opener, path) {
            Ok(bytes) if bytes == mount_sfb => {
                debug!(device = %path.display(), "physical device matched");
                return Ok(path.clone());
            }
            Ok(_) => debug!(device = %path.display(), "SFB bytes differ"),
            Err(err) => debug!(device = %path.display(), %err, "device unreadable"),
        }
    }
    Err(DumpError::NoPhysicalDeviceMatch)
}

fn sfb_bytes_from_device(opener: &dyn IsoOpener, path: &Path) -> Result<Vec<u8>> {
    let fs = opener.open(Box::new(File::open(path)?))?;
    let record = fs.file_record("\\PS3_DISC.SFB")?;
    let clusters = fs.file_clusters("\\PS3_DISC.SFB")?;
    let mut device = RawDisc::open(path)?;
    read_clusters(&mut device, &clusters, record.length)
}

/// Read `length` bytes spread over the given cluster ranges, in order.
pub(crate) fn read_clusters(
    device: &mut dyn RawDevice,
    clusters: &[SectorRange],
    length: u64,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(length as usize);
    let mut remaining = length;
    for range in clusters {
        if remaining == 0 {
            break;
        }
        let span = (range.sectors() * SECTOR_SIZE as u64).min(remaining);
        device.seek(SeekFrom::Start(range.start * SECTOR_SIZE as u64))?;
        let mut buf = vec![0u8; span as usize];
        device.read_exact(&mut buf)?;
        out.extend_from_slice(&buf);
        remaining -= span;
    }
    Ok(out)
}
