//! Error types for the dumping engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DumpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No mounted volume carries a `PS3_DISC.SFB` at its root.
    #[error("no mounted PS3 disc found")]
    DiscNotFound,

    /// `PS3_DISC.SFB` was found but the disc metadata is unusable.
    #[error("invalid disc: {0}")]
    InvalidDisc(String),

    /// No raw block device produced the same `PS3_DISC.SFB` bytes as the mount.
    #[error("no physical device matches the mounted disc")]
    NoPhysicalDeviceMatch,

    /// The key cache yielded no candidate keys that have not already been tried.
    #[error("no untested decryption keys available")]
    NoKey,

    /// Every untested candidate key failed the known-plaintext probe.
    #[error("no candidate key decrypts the disc")]
    NoMatch,

    /// Neither detection-probe file exists on the disc with non-zero length.
    #[error("no detection file present on disc")]
    DetectionFileMissing,

    #[error("invalid SFB manifest: {0}")]
    InvalidSfb(String),

    #[error("invalid SFO table: {0}")]
    InvalidSfo(String),

    #[error("invalid IRD archive: {0}")]
    InvalidIrd(String),

    #[error("invalid key file: {0}")]
    InvalidKey(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DumpError>;
