//! Multi-algorithm streaming hashing for dump verification

use serde::Serialize;
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Hash algorithms accepted in reference metadata.
///
/// MD5 is always computed during a copy; the others are added when a
/// reference record carries them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Sha256 => "SHA-256",
        }
    }

    /// Expected digest length in hex characters.
    pub fn hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Md5 => 32,
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Sha256 => 64,
        }
    }

    /// Guess the algorithm from a hex digest's length.
    pub fn from_digest_len(len: usize) -> Option<Self> {
        match len {
            32 => Some(HashAlgorithm::Md5),
            40 => Some(HashAlgorithm::Sha1),
            64 => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// Compare two hex digests (case-insensitive).
pub fn digests_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Feeds one byte window through every requested digest at once.
pub struct MultiHasher {
    md5: md5::Context,
    sha1: Option<Sha1>,
    sha256: Option<Sha256>,
}

impl MultiHasher {
    /// MD5 is always active; `extra` switches on the optional digests.
    pub fn new(extra: &[HashAlgorithm]) -> Self {
        Self {
            md5: md5::Context::new(),
            sha1: extra.contains(&HashAlgorithm::Sha1).then(Sha1::new),
            sha256: extra.contains(&HashAlgorithm::Sha256).then(Sha256::new),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.md5.consume(data);
        if let Some(h) = self.sha1.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.sha256.as_mut() {
            h.update(data);
        }
    }

    /// Finalize every digest as a lowercase hex string.
    pub fn finalize(self) -> Vec<(HashAlgorithm, String)> {
        let mut out = vec![(HashAlgorithm::Md5, format!("{:x}", self.md5.compute()))];
        if let Some(h) = self.sha1 {
            out.push((HashAlgorithm::Sha1, hex::encode(h.finalize())));
        }
        if let Some(h) = self.sha256 {
            out.push((HashAlgorithm::Sha256, hex::encode(h.finalize())));
        }
        out
    }
}
