//! Engine host surface
//!
//! One [`Dumper`] drives one disc through the three phases of a dump:
//! identification, key selection, and the verified copy. Hosts observe
//! progress through cheap snapshots and cancel cooperatively.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::device::{RawDevice, RawDisc};
use crate::drives;
use crate::dump::{run_dump, DumpJob, DumpReport, Progress, Validator};
use crate::error::{DumpError, Result};
use crate::identify::{self, DetectedDisc, DiscIdentity};
use crate::iso::{DiscContents, IsoFilesystem, IsoOpener};
use crate::keys::{self, KeyIndex};
use crate::probe::{self, SelectedKey};

/// Bytes of the raw device cached in memory for filesystem parsing, so
/// directory enumeration does not seek-storm the drive.
const FS_CACHE_BYTES: usize = 64 * 1024 * 1024;

/// Dumping engine for a single identified disc.
pub struct Dumper {
    device: Box<dyn RawDevice>,
    fs: Box<dyn IsoFilesystem>,
    identity: DiscIdentity,
    output_name: String,
    mount_files: HashSet<String>,
    key_index: KeyIndex,
    tested: HashSet<String>,
    selected: Option<SelectedKey>,
    contents: Option<DiscContents>,
    progress: Arc<Mutex<Progress>>,
    cancel: CancellationToken,
}

impl Dumper {
    /// Identify the disc and attach to its raw device.
    ///
    /// Scans mounted volumes for `PS3_DISC.SFB` (or uses `input_dir` when
    /// given), parses the manifests, then finds the block device whose SFB
    /// bytes match the mount's copy.
    pub fn detect(
        opener: &dyn IsoOpener,
        input_dir: Option<&Path>,
        template: Option<&str>,
    ) -> Result<Self> {
        let detected = identify::detect_disc(input_dir, template)?;
        let devices = drives::optical_devices();
        let device_path =
            identify::match_physical_device(opener, &devices, &detected.sfb_bytes)?;
        info!(
            product_code = %detected.identity.product_code,
            device = %device_path.display(),
            "disc detected"
        );

        let device = Box::new(RawDisc::open(&device_path)?);
        let fs = open_cached_filesystem(opener, &device_path)?;
        Ok(Self::with_parts(device, fs, detected))
    }

    /// Assemble an engine from already-open parts.
    ///
    /// This is the seam hosts (and tests) use when the device and ISO reader
    /// are not discovered through the OS — dumping an image file, say.
    pub fn with_parts(
        device: Box<dyn RawDevice>,
        fs: Box<dyn IsoFilesystem>,
        detected: DetectedDisc,
    ) -> Self {
        let mount_files = detected
            .mount_files
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        Self {
            device,
            fs,
            identity: detected.identity,
            output_name: detected.output_name,
            mount_files,
            key_index: KeyIndex::new(),
            tested: HashSet::new(),
            selected: None,
            contents: None,
            progress: Arc::new(Mutex::new(Progress::default())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn identity(&self) -> &DiscIdentity {
        &self.identity
    }

    /// Rendered output-directory name (template applied and sanitized).
    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// Load the key cache and choose the key that decrypts this disc.
    ///
    /// Returns the chosen key id. Keys probed here stay marked for the
    /// engine's lifetime, so a second call only considers newly cached keys.
    pub fn find_key(&mut self, cache_dir: &Path) -> Result<String> {
        self.cancel.check()?;
        keys::load_key_cache(
            &self.key_index,
            cache_dir,
            &self.identity.product_code,
            &self.cancel,
        )?;
        if self.key_index.is_empty() {
            return Err(DumpError::NoKey);
        }

        let probe = probe::build_probe(self.fs.as_ref(), self.device.as_mut())?;
        let selected = probe::select_key(
            &self.key_index,
            &probe,
            &mut self.tested,
            &self.identity.product_code,
            &self.cancel,
        )?;
        info!(key_id = %selected.key_id, source = ?selected.record.source, "key found");

        let key_id = selected.key_id.clone();
        self.selected = Some(selected);
        Ok(key_id)
    }

    /// Dump the disc under `output_base`, into the templated directory.
    ///
    /// Requires a prior successful [`find_key`](Self::find_key). Per-file
    /// failures accumulate in the report; only cancellation ends the run
    /// early, and a cancelled run leaves partial output in place.
    pub fn dump(&mut self, output_base: &Path) -> Result<DumpReport> {
        let selected = self.selected.as_ref().ok_or(DumpError::NoKey)?;

        let contents = match &self.contents {
            Some(contents) => contents.clone(),
            None => {
                let contents = self.fs.contents()?;
                self.contents = Some(contents.clone());
                contents
            }
        };
        let regions = self.device.unprotected_regions()?;
        let group = self.key_index.group(&selected.key_id);
        let validator =
            Validator::from_records(&group, &self.identity.disc_version, &contents.files);

        let output_dir = output_base.join(&self.output_name);
        run_dump(DumpJob {
            device: self.device.as_mut(),
            contents: &contents,
            regions: &regions,
            key: selected.key,
            validator: &validator,
            mount_files: Some(&self.mount_files),
            output_dir: &output_dir,
            progress: &self.progress,
            cancel: &self.cancel,
        })
    }

    /// Snapshot of the observable dump state.
    pub fn progress(&self) -> Progress {
        self.progress.lock().unwrap().clone()
    }

    /// Token hosts can hold to cancel from another thread.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Parse the filesystem from an in-memory prefix of the device, falling back
/// to the live device on parse failure.
fn open_cached_filesystem(
    opener: &dyn IsoOpener,
    device_path: &Path,
) -> Result<Box<dyn IsoFilesystem>> {
    let mut file = File::open(device_path)?;
    let mut prefix = vec![0u8; FS_CACHE_BYTES];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = file.read(&mut prefix[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    prefix.truncate(filled);

    match opener.open(Box::new(Cursor::new(prefix))) {
        Ok(fs) => Ok(fs),
        Err(err) => {
            warn!(%err, "cached filesystem parse failed, using the live device");
            opener.open(Box::new(File::open(device_path)?))
        }
    }
}

/// Convenience wrapper matching the host-boundary contract: identify the
/// mounted disc and return its identity without attaching a device.
pub fn detect_disc(
    input_dir: Option<&Path>,
    template: Option<&str>,
) -> Result<(DiscIdentity, PathBuf)> {
    let detected = identify::detect_disc(input_dir, template)?;
    Ok((detected.identity, detected.input_root))
}
