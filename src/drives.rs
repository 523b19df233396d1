//! Platform enumeration of optical drives and mounted volumes

use std::path::PathBuf;

#[cfg(unix)]
mod platform {
    use super::*;
    use std::fs;

    /// Raw optical block devices: the kernel CD-ROM info table plus `/dev/sr*`.
    pub fn optical_devices() -> Vec<PathBuf> {
        let mut found = Vec::new();

        if let Ok(info) = fs::read_to_string("/proc/sys/dev/cdrom/info") {
            for line in info.lines() {
                if let Some(rest) = line.strip_prefix("drive name:") {
                    for name in rest.split_whitespace() {
                        found.push(PathBuf::from(format!("/dev/{name}")));
                    }
                }
            }
        }

        if let Ok(entries) = fs::read_dir("/dev") {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy().into_owned();
                if let Some(suffix) = name.strip_prefix("sr") {
                    if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                        found.push(entry.path());
                    }
                }
            }
        }

        found.sort();
        found.dedup();
        found.retain(|path| path.exists());
        found
    }

    /// Mount points of the optical devices, read from `/proc/mounts`.
    pub fn mounted_candidates() -> Vec<PathBuf> {
        let Ok(mounts) = fs::read_to_string("/proc/mounts") else {
            return Vec::new();
        };

        let devices = optical_devices();
        let mut candidates = Vec::new();
        for line in mounts.lines() {
            let mut parts = line.split_whitespace();
            let (Some(device), Some(mount_point)) = (parts.next(), parts.next()) else {
                continue;
            };
            let device = PathBuf::from(device);
            if devices.contains(&device) || device.to_string_lossy().starts_with("/dev/sr") {
                candidates.push(PathBuf::from(unescape_mount(mount_point)));
            }
        }
        candidates
    }

    /// `/proc/mounts` escapes spaces and friends as octal (`\040`).
    fn unescape_mount(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\\' {
                let digits: String = chars.clone().take(3).collect();
                if digits.len() == 3 && digits.chars().all(|d| d.is_digit(8)) {
                    if let Ok(code) = u8::from_str_radix(&digits, 8) {
                        out.push(code as char);
                        chars.nth(2);
                        continue;
                    }
                }
            }
            out.push(c);
        }
        out
    }

}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::fs::File;

    /// Raw optical devices in the `\\.\CDROMn` namespace, probed 0..31.
    pub fn optical_devices() -> Vec<PathBuf> {
        (0..32)
            .map(|n| PathBuf::from(format!(r"\\.\CDROM{n}")))
            .filter(|path| File::open(path).is_ok())
            .collect()
    }

    /// Drive-letter roots of mounted volumes.
    pub fn mounted_candidates() -> Vec<PathBuf> {
        (b'A'..=b'Z')
            .map(|letter| PathBuf::from(format!(r"{}:\", letter as char)))
            .filter(|path| path.exists())
            .collect()
    }
}

pub use platform::{mounted_candidates, optical_devices};
