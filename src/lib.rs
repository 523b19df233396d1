//! ps3dump - verified decryption dumping of PS3 Blu-ray game discs
//!
//! Given a mounted disc (for the on-disc manifests) and the same disc as a
//! raw block device (for encrypted sector reads), the engine identifies the
//! title, picks the right AES key out of a local cache of IRD archives and
//! redump key dumps, copies every file while transparently decrypting the
//! encrypted regions, and validates the result against per-file reference
//! hashes.
//!
//! The usual flow is three calls on a [`Dumper`]:
//!
//! ```no_run
//! # fn main() -> ps3dump::Result<()> {
//! # let opener: Box<dyn ps3dump::IsoOpener> = unimplemented!();
//! let mut dumper = ps3dump::Dumper::detect(opener.as_ref(), None, None)?;
//! dumper.find_key(std::path::Path::new("/home/user/.ird"))?;
//! let report = dumper.dump(std::path::Path::new("/dumps"))?;
//! # Ok(())
//! # }
//! ```
//!
//! The low-level ISO-9660 reader is an external collaborator supplied through
//! [`IsoOpener`]; everything else ships in this crate.

mod cancel;
mod cipher;
mod device;
mod drives;
mod dump;
mod dumper;
mod error;
mod hashes;
mod identify;
mod iso;
mod keys;
mod probe;
mod sector;
mod sfb;
mod sfo;
mod stream;

pub use cancel::CancellationToken;
pub use cipher::{decrypt_buffer, DiscKey};
pub use device::{sector_iv, RawDevice, RawDisc};
pub use drives::{mounted_candidates, optical_devices};
pub use dump::{
    broken_reason, BrokenFile, DumpReport, Progress, ValidationStatus, Validator, Verdict,
};
pub use dumper::{detect_disc, Dumper};
pub use error::{DumpError, Result};
pub use hashes::{HashAlgorithm, MultiHasher};
pub use identify::{
    identify_mount, output_dir_name, region_for_product_code, DetectedDisc, DiscIdentity,
    DEFAULT_TEMPLATE,
};
pub use iso::{DirRecord, DiscContents, FileRecord, IsoFilesystem, IsoOpener, ReadSeek};
pub use keys::{ird, redump, KeyIndex, KeyRecord, KeySource};
pub use probe::{build_probe, select_key, DetectionProbe, SelectedKey, DETECTION_FILES};
pub use sector::{SectorRange, SECTOR_SIZE};
pub use sfb::DiscSfb;
pub use sfo::{ParamSfo, SfoValue};
pub use stream::{DecryptionStream, StreamSummary};
