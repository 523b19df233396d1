//! Shared fixtures for the end-to-end dump scenarios: an in-memory disc
//! image builder, a scriptable raw device, and a fake ISO reader.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use ps3dump::{
    sector_iv, CancellationToken, DirRecord, DiscContents, DiscKey, FileRecord, IsoFilesystem,
    RawDevice, SectorRange, SECTOR_SIZE,
};

pub const PRODUCT_CODE: &str = "BLES01234";
pub const GAME_VERSION: &str = "01.00";
pub const TITLE: &str = "Example Game";

/// First sector of the encrypted region in the fixture layout.
const ENCRYPTED_START: u64 = 8;

// ---------------------------------------------------------------------------
// Manifest builders
// ---------------------------------------------------------------------------

pub fn build_sfb(fields: &[(&str, &str)]) -> Vec<u8> {
    let mut data = vec![0u8; 0x200];
    data[0..4].copy_from_slice(b".SFB");
    data[4..8].copy_from_slice(&1u32.to_be_bytes());

    // Values live past the entry table, like the real 0x200-byte layout.
    let mut value_offset = 0x200;
    for (i, (name, value)) in fields.iter().enumerate() {
        let entry = 0x20 + i * 0x20;
        data[entry..entry + name.len()].copy_from_slice(name.as_bytes());
        data[entry + 16..entry + 20].copy_from_slice(&(value_offset as u32).to_be_bytes());
        data[entry + 20..entry + 24].copy_from_slice(&(value.len() as u32).to_be_bytes());
        if value_offset + value.len() > data.len() {
            data.resize(value_offset + value.len(), 0);
        }
        data[value_offset..value_offset + value.len()].copy_from_slice(value.as_bytes());
        value_offset += value.len();
    }
    data
}

pub fn build_sfo(fields: &[(&str, &str)]) -> Vec<u8> {
    let header_len = 0x14 + fields.len() * 0x10;
    let mut keys = Vec::new();
    let mut key_offsets = Vec::new();
    for (key, _) in fields {
        key_offsets.push(keys.len());
        keys.extend_from_slice(key.as_bytes());
        keys.push(0);
    }
    let mut values = Vec::new();
    let mut value_offsets = Vec::new();
    for (_, value) in fields {
        value_offsets.push(values.len());
        values.extend_from_slice(value.as_bytes());
        values.push(0);
    }

    let key_table = header_len;
    let data_table = key_table + keys.len();

    let mut data = Vec::new();
    data.extend_from_slice(&[0x00, b'P', b'S', b'F']);
    data.extend_from_slice(&0x0101u32.to_le_bytes());
    data.extend_from_slice(&(key_table as u32).to_le_bytes());
    data.extend_from_slice(&(data_table as u32).to_le_bytes());
    data.extend_from_slice(&(fields.len() as u32).to_le_bytes());
    for (i, (_, value)) in fields.iter().enumerate() {
        let len = value.len() as u32 + 1;
        data.extend_from_slice(&(key_offsets[i] as u16).to_le_bytes());
        data.extend_from_slice(&0x0204u16.to_le_bytes());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&(value_offsets[i] as u32).to_le_bytes());
    }
    data.extend_from_slice(&keys);
    data.extend_from_slice(&values);
    data
}

/// Serialize and gzip a version-6 IRD archive.
pub fn build_ird(
    product_code: &str,
    game_version: &str,
    file_hashes: &[(u64, [u8; 16])],
    data1: [u8; 16],
) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(b"3IRD");
    raw.push(6);
    raw.extend_from_slice(product_code.as_bytes());
    for s in [TITLE, "04.80", game_version, "01.00"] {
        raw.push(s.len() as u8);
        raw.extend_from_slice(s.as_bytes());
    }
    raw.extend_from_slice(&0u32.to_le_bytes()); // header image
    raw.extend_from_slice(&0u32.to_le_bytes()); // footer image
    raw.push(0); // region hashes
    raw.extend_from_slice(&(file_hashes.len() as u32).to_le_bytes());
    for (sector, md5) in file_hashes {
        raw.extend_from_slice(&sector.to_le_bytes());
        raw.extend_from_slice(md5);
    }
    raw.extend_from_slice(&0u16.to_le_bytes());
    raw.extend_from_slice(&0u16.to_le_bytes());
    raw.extend_from_slice(&data1);
    raw.extend_from_slice(&[0u8; 16]); // data2
    raw.extend_from_slice(&[0u8; 115]); // pic
    raw.extend_from_slice(&1u32.to_le_bytes()); // uid
    raw.extend_from_slice(&0u32.to_le_bytes()); // crc

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw).unwrap();
    encoder.finish().unwrap()
}

// ---------------------------------------------------------------------------
// Disc image
// ---------------------------------------------------------------------------

pub struct TestDisc {
    pub image: Vec<u8>,
    pub contents: DiscContents,
    /// (disc path, plaintext) of every file.
    pub plaintext: Vec<(String, Vec<u8>)>,
    pub regions: Vec<SectorRange>,
    pub key: DiscKey,
}

impl TestDisc {
    pub fn plaintext_of(&self, path: &str) -> &[u8] {
        &self
            .plaintext
            .iter()
            .find(|(p, _)| p == path)
            .expect("fixture file")
            .1
    }

    pub fn record_of(&self, path: &str) -> &FileRecord {
        self.contents
            .files
            .iter()
            .find(|f| f.source_path == path)
            .expect("fixture record")
    }

    /// Per-file (start sector, MD5) reference records for an IRD.
    pub fn reference_hashes(&self) -> Vec<(u64, [u8; 16])> {
        self.plaintext
            .iter()
            .map(|(path, data)| (self.record_of(path).start_sector, md5::compute(data).0))
            .collect()
    }
}

fn timestamp(index: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_600_000_000 + index * 60)
}

/// Lay out a disc: sector 0 region table, SFB in the leading plain region,
/// game files in the encrypted region, optional trailing file in the final
/// plain region.
pub fn build_test_disc(key: DiscKey, extra: &[(&str, &[u8])]) -> TestDisc {
    let sfb = build_sfb(&[("HYBRID_FLAG", "g"), ("TITLE_ID", PRODUCT_CODE)]);
    let sfo = build_sfo(&[
        ("TITLE", TITLE),
        ("TITLE_ID", PRODUCT_CODE),
        ("VERSION", GAME_VERSION),
        ("APP_VER", "01.02"),
    ]);

    let mut lic = b"PS3LICDA".to_vec();
    lic.resize(3000, 0x4C);
    let mut eboot = vec![b'S', b'C', b'E', 0, 0, 0, 0, 2];
    eboot.resize(2500, 0xEB);

    // (path, data, encrypted)
    let mut layout: Vec<(String, Vec<u8>, bool)> =
        vec![("\\PS3_DISC.SFB".to_string(), sfb, false)];
    let mut encrypted_files: Vec<(String, Vec<u8>)> = vec![
        ("\\PS3_GAME\\PARAM.SFO".to_string(), sfo),
        ("\\PS3_GAME\\LICDIR\\LIC.DAT".to_string(), lic),
        ("\\PS3_GAME\\USRDIR\\EBOOT.BIN".to_string(), eboot),
    ];
    for (path, data) in extra {
        encrypted_files.push((path.to_string(), data.to_vec()));
    }
    let tail = ("\\PS3_GAME\\USRDIR\\MOVIE.PAM".to_string(), vec![0xA7u8; 2200]);

    // Allocate sectors: SFB right after the region table.
    let mut files = Vec::new();
    let mut plaintext = Vec::new();
    let mut next_sector = 1u64;
    let place = |path: String, data: Vec<u8>, sector: &mut u64, out: &mut Vec<(u64, bool, Vec<u8>)>, encrypted: bool, files: &mut Vec<FileRecord>, plaintext: &mut Vec<(String, Vec<u8>)>| {
        let index = files.len() as u64;
        files.push(FileRecord {
            source_path: path.clone(),
            start_sector: *sector,
            length: data.len() as u64,
            created: Some(timestamp(index)),
            modified: Some(timestamp(index) + Duration::from_secs(30)),
        });
        out.push((*sector, encrypted, data.clone()));
        plaintext.push((path, data.clone()));
        *sector += (data.len() as u64).div_ceil(SECTOR_SIZE as u64);
    };

    let mut placed: Vec<(u64, bool, Vec<u8>)> = Vec::new();
    for (path, data, encrypted) in layout.drain(..) {
        place(path, data, &mut next_sector, &mut placed, encrypted, &mut files, &mut plaintext);
    }
    assert!(next_sector <= ENCRYPTED_START, "plain head overflow");
    next_sector = ENCRYPTED_START;
    for (path, data) in encrypted_files {
        place(path, data, &mut next_sector, &mut placed, true, &mut files, &mut plaintext);
    }
    let encrypted_end = next_sector; // first sector of the trailing plain region
    place(tail.0, tail.1, &mut next_sector, &mut placed, false, &mut files, &mut plaintext);
    let total_sectors = next_sector + 1; // one spare plain sector at the end

    // Region table: plain [0, 8), encrypted [8, end), plain [end, total).
    let regions = vec![
        SectorRange::new(0, ENCRYPTED_START),
        SectorRange::new(encrypted_end, total_sectors),
    ];
    let mut header = vec![0u8; SECTOR_SIZE];
    header[0..4].copy_from_slice(&2u32.to_be_bytes());
    for (i, end) in [
        ENCRYPTED_START as u32 - 1,
        encrypted_end as u32 - 1,
        total_sectors as u32 - 1,
    ]
    .iter()
    .enumerate()
    {
        header[12 + i * 4..16 + i * 4].copy_from_slice(&end.to_be_bytes());
    }

    let mut image = vec![0u8; total_sectors as usize * SECTOR_SIZE];
    image[..SECTOR_SIZE].copy_from_slice(&header);
    for (start, encrypted, data) in placed {
        let mut padded = data;
        let sectors = (padded.len() as u64).div_ceil(SECTOR_SIZE as u64);
        padded.resize(sectors as usize * SECTOR_SIZE, 0);
        for s in 0..sectors {
            let abs = start + s;
            let chunk = &mut padded[s as usize * SECTOR_SIZE..(s as usize + 1) * SECTOR_SIZE];
            if encrypted {
                encrypt_sector(chunk, &key, abs);
            }
            let offset = abs as usize * SECTOR_SIZE;
            image[offset..offset + SECTOR_SIZE].copy_from_slice(chunk);
        }
    }

    let dirs = vec![
        dir_record("\\PS3_GAME", 100),
        dir_record("\\PS3_GAME\\LICDIR", 101),
        dir_record("\\PS3_GAME\\USRDIR", 102),
        dir_record("\\PS3_UPDATE", 103), // stays empty
    ];

    TestDisc {
        image,
        contents: DiscContents { files, dirs },
        plaintext,
        regions,
        key,
    }
}

fn dir_record(path: &str, index: u64) -> DirRecord {
    DirRecord {
        source_path: path.to_string(),
        created: Some(timestamp(index)),
        modified: Some(timestamp(index) + Duration::from_secs(30)),
    }
}

fn encrypt_sector(data: &mut [u8], key: &DiscKey, sector: u64) {
    use aes::cipher::{BlockEncryptMut, KeyIvInit};
    let iv = sector_iv(sector);
    let mut encryptor = cbc::Encryptor::<aes::Aes128>::new(key.into(), (&iv).into());
    for block in data.chunks_exact_mut(16) {
        encryptor.encrypt_block_mut(block.into());
    }
}

/// Mirror the disc's plaintext tree into a mount directory.
pub fn write_mount(root: &Path, disc: &TestDisc) {
    for dir in &disc.contents.dirs {
        std::fs::create_dir_all(root.join(host_path(&dir.source_path))).unwrap();
    }
    for (path, data) in &disc.plaintext {
        let target = root.join(host_path(path));
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(target, data).unwrap();
    }
}

pub fn host_path(disc_path: &str) -> std::path::PathBuf {
    disc_path
        .trim_start_matches('\\')
        .split('\\')
        .collect()
}

// ---------------------------------------------------------------------------
// Scriptable raw device
// ---------------------------------------------------------------------------

/// Shared slot the test fills with the engine's token after construction,
/// letting the device cancel the run from inside a read.
pub type CancelSlot = Arc<Mutex<Option<CancellationToken>>>;

/// In-memory raw device with optional per-sector read corruption and an
/// optional cancel trigger.
pub struct ScriptedDisc {
    cursor: Cursor<Vec<u8>>,
    regions: Vec<SectorRange>,
    /// Sectors whose next reads come back flipped; front is consumed first.
    corruptions: VecDeque<u64>,
    /// Corrupt this sector on every read.
    always_corrupt: Option<u64>,
    cancel_at_sector: Option<(u64, CancelSlot)>,
}

impl ScriptedDisc {
    pub fn new(disc: &TestDisc) -> Self {
        Self {
            cursor: Cursor::new(disc.image.clone()),
            regions: disc.regions.clone(),
            corruptions: VecDeque::new(),
            always_corrupt: None,
            cancel_at_sector: None,
        }
    }

    /// Corrupt the next read of `sector`, once.
    pub fn corrupt_once(mut self, sector: u64) -> Self {
        self.corruptions.push_back(sector);
        self
    }

    pub fn corrupt_always(mut self, sector: u64) -> Self {
        self.always_corrupt = Some(sector);
        self
    }

    pub fn cancel_when_reading(mut self, sector: u64, slot: CancelSlot) -> Self {
        self.cancel_at_sector = Some((sector, slot));
        self
    }
}

impl Read for ScriptedDisc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.cursor.position();
        let n = self.cursor.read(buf)?;
        let sector = pos / SECTOR_SIZE as u64;
        let at_sector_start = pos % SECTOR_SIZE as u64 == 0;

        if n > 0 && at_sector_start {
            let flip = self.always_corrupt == Some(sector)
                || self
                    .corruptions
                    .front()
                    .is_some_and(|&s| s == sector)
                    .then(|| self.corruptions.pop_front())
                    .is_some();
            if flip {
                buf[0] ^= 0xFF;
            }
        }

        if let Some((trigger, slot)) = &self.cancel_at_sector {
            if sector >= *trigger {
                if let Some(token) = slot.lock().unwrap().as_ref() {
                    token.cancel();
                }
            }
        }

        Ok(n)
    }
}

impl Seek for ScriptedDisc {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl RawDevice for ScriptedDisc {
    fn sector_iv(&mut self, sector: u64) -> ps3dump::Result<[u8; 16]> {
        Ok(sector_iv(sector))
    }

    fn unprotected_regions(&mut self) -> ps3dump::Result<Vec<SectorRange>> {
        Ok(self.regions.clone())
    }
}

// ---------------------------------------------------------------------------
// Fake ISO reader
// ---------------------------------------------------------------------------

pub struct FakeFs {
    pub contents: DiscContents,
}

impl FakeFs {
    pub fn new(disc: &TestDisc) -> Self {
        Self {
            contents: disc.contents.clone(),
        }
    }
}

impl IsoFilesystem for FakeFs {
    fn sector_size(&self) -> u64 {
        SECTOR_SIZE as u64
    }

    fn total_sectors(&self) -> u64 {
        self.contents
            .files
            .iter()
            .map(|f| f.start_sector + (f.length.max(1)).div_ceil(SECTOR_SIZE as u64))
            .max()
            .unwrap_or(0)
    }

    fn file_exists(&self, path: &str) -> bool {
        self.contents.files.iter().any(|f| f.source_path == path)
    }

    fn file_clusters(&self, path: &str) -> ps3dump::Result<Vec<SectorRange>> {
        let record = self.file_record(path)?;
        Ok(vec![SectorRange::new(
            record.start_sector,
            record.start_sector + record.length.div_ceil(SECTOR_SIZE as u64),
        )])
    }

    fn file_record(&self, path: &str) -> ps3dump::Result<FileRecord> {
        self.contents
            .files
            .iter()
            .find(|f| f.source_path == path)
            .cloned()
            .ok_or_else(|| ps3dump::DumpError::InvalidDisc(format!("no such file {path}")))
    }

    fn contents(&self) -> ps3dump::Result<DiscContents> {
        Ok(self.contents.clone())
    }
}
