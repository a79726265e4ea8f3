//! Durable face sample store.
//!
//! Samples are lossless PNG crops named `student_<id>_<YYYYmmdd>_<HHMMSS>[_<seq>].png`.
//! The JSON index next to them is the source of truth; file names are only
//! parsed when the index has to be rebuilt from a bare directory.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use image::{GrayImage, ImageFormat};
use rollcall_core::IdentityId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SAMPLE_PREFIX: &str = "student_";
const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const SAMPLE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sample store i/o at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write sample {path}: {source}")]
    Encode {
        path: String,
        source: image::ImageError,
    },
    #[error("sample index {path}: {source}")]
    Index {
        path: String,
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Reference to one stored sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRef {
    pub identity_id: IdentityId,
    pub file_name: String,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SampleIndex {
    version: u32,
    samples: Vec<SampleRef>,
}

impl Default for SampleIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            samples: Vec::new(),
        }
    }
}

/// File name for a sample; `seq` > 0 disambiguates same-second captures.
pub fn sample_file_name(identity: IdentityId, captured_at: DateTime<Utc>, seq: u32) -> String {
    let stamp = captured_at.format(TIMESTAMP_FORMAT);
    if seq == 0 {
        format!("{SAMPLE_PREFIX}{identity}_{stamp}.png")
    } else {
        format!("{SAMPLE_PREFIX}{identity}_{stamp}_{seq}.png")
    }
}

/// Recover identity and capture time from a sample file name.
///
/// PNG stamps are UTC. Legacy `.jpg` samples were stamped in local time and
/// are converted to UTC; anything else yields `None`.
pub fn parse_sample_name(name: &str) -> Option<(IdentityId, DateTime<Utc>)> {
    let rest = name.strip_prefix(SAMPLE_PREFIX)?;
    let (stem, ext) = rest.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    if !SAMPLE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }

    let parts: Vec<&str> = stem.split('_').collect();
    let (id, date, time) = match parts.as_slice() {
        [id, date, time] => (*id, *date, *time),
        [id, date, time, seq] => {
            seq.parse::<u32>().ok()?;
            (*id, *date, *time)
        }
        _ => return None,
    };

    let identity = IdentityId(id.parse().ok()?);
    let naive = NaiveDateTime::parse_from_str(&format!("{date}_{time}"), TIMESTAMP_FORMAT).ok()?;
    let captured_at = if ext == "png" {
        Utc.from_utc_datetime(&naive)
    } else {
        Local.from_local_datetime(&naive).earliest()?.with_timezone(&Utc)
    };
    Some((identity, captured_at))
}

/// Labeled grayscale samples on disk.
pub struct SampleStore {
    dir: PathBuf,
    index: SampleIndex,
}

impl SampleStore {
    /// Open the store at `dir`. A missing directory is an empty store; a
    /// missing or unreadable index is rebuilt from the directory listing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let mut store = Self::new(dir);
        store.reload()?;
        Ok(store)
    }

    /// An empty handle on `dir` without touching the disk; call
    /// [`reload`](Self::reload) to read the index.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            index: SampleIndex::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    /// Re-read the index from disk, rebuilding it when needed.
    pub fn reload(&mut self) -> Result<(), StoreError> {
        if !self.dir.exists() {
            self.index = SampleIndex::default();
            return Ok(());
        }

        let index_path = self.index_path();
        match std::fs::read(&index_path) {
            Ok(bytes) => match serde_json::from_slice::<SampleIndex>(&bytes) {
                Ok(index) => {
                    self.index = index;
                    tracing::debug!(samples = self.index.samples.len(), "sample index loaded");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(path = %index_path.display(), error = %e, "sample index unreadable; rebuilding");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(dir = %self.dir.display(), "no sample index; rebuilding from directory");
            }
            Err(e) => return Err(io_err(&index_path)(e)),
        }

        self.rebuild_index()?;
        Ok(())
    }

    /// Scan the directory for well-named samples and rewrite the index.
    /// Returns the number of samples found.
    pub fn rebuild_index(&mut self) -> Result<usize, StoreError> {
        let mut samples = Vec::new();
        let mut skipped = 0usize;

        for entry in std::fs::read_dir(&self.dir).map_err(io_err(&self.dir))? {
            let entry = entry.map_err(io_err(&self.dir))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                skipped += 1;
                continue;
            };
            if name == INDEX_FILE {
                continue;
            }
            match parse_sample_name(&name) {
                Some((identity_id, captured_at)) => samples.push(SampleRef {
                    identity_id,
                    file_name: name,
                    captured_at,
                }),
                None => {
                    skipped += 1;
                    tracing::debug!(file = %name, "ignoring file with unexpected name");
                }
            }
        }

        samples.sort_by(|a, b| {
            a.captured_at
                .cmp(&b.captured_at)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });

        let found = samples.len();
        self.index = SampleIndex {
            version: INDEX_VERSION,
            samples,
        };
        self.save_index()?;

        tracing::info!(dir = %self.dir.display(), samples = found, skipped, "sample index rebuilt");
        Ok(found)
    }

    fn save_index(&self) -> Result<(), StoreError> {
        let path = self.index_path();
        let bytes = serde_json::to_vec_pretty(&self.index).map_err(|source| StoreError::Index {
            path: path.display().to_string(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(io_err(&path))?;
        Ok(())
    }

    /// Persist a face crop for `identity`, stamped with the current time.
    pub fn add(&mut self, identity: IdentityId, region: &GrayImage) -> Result<SampleRef, StoreError> {
        self.add_at(identity, region, Utc::now())
    }

    /// Persist a face crop with an explicit capture time. Never overwrites:
    /// same-second captures get a `_<seq>` suffix.
    pub fn add_at(
        &mut self,
        identity: IdentityId,
        region: &GrayImage,
        captured_at: DateTime<Utc>,
    ) -> Result<SampleRef, StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;

        let mut seq = 0u32;
        let file_name = loop {
            let candidate = sample_file_name(identity, captured_at, seq);
            let taken = self.dir.join(&candidate).exists()
                || self.index.samples.iter().any(|s| s.file_name == candidate);
            if !taken {
                break candidate;
            }
            seq += 1;
        };

        let path = self.dir.join(&file_name);
        region
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|source| StoreError::Encode {
                path: path.display().to_string(),
                source,
            })?;

        let sample = SampleRef {
            identity_id: identity,
            file_name,
            captured_at,
        };
        self.index.samples.push(sample.clone());

        if let Err(e) = self.save_index() {
            // Keep disk and index in agreement: drop the orphaned file.
            self.index.samples.pop();
            if let Err(rm) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %rm, "failed to remove orphaned sample");
            }
            return Err(e);
        }

        tracing::info!(
            identity = %identity,
            file = %sample.file_name,
            width = region.width(),
            height = region.height(),
            "face sample stored"
        );
        Ok(sample)
    }

    /// Every indexed sample, loaded lazily. Unreadable files are skipped.
    pub fn all(&self) -> impl Iterator<Item = (IdentityId, GrayImage)> + '_ {
        self.index.samples.iter().filter_map(move |sample| {
            let path = self.dir.join(&sample.file_name);
            match image::open(&path) {
                Ok(img) => Some((sample.identity_id, img.into_luma8())),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable sample");
                    None
                }
            }
        })
    }

    pub fn samples(&self) -> &[SampleRef] {
        &self.index.samples
    }

    pub fn samples_for(&self, identity: IdentityId) -> impl Iterator<Item = &SampleRef> + '_ {
        self.index
            .samples
            .iter()
            .filter(move |s| s.identity_id == identity)
    }

    /// Distinct identities with at least one sample, sorted.
    pub fn identities(&self) -> Vec<IdentityId> {
        let mut ids: Vec<IdentityId> = self.index.samples.iter().map(|s| s.identity_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn len(&self) -> usize {
        self.index.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn region(value: u8) -> GrayImage {
        GrayImage::from_fn(40, 40, |x, y| Luma([value.wrapping_add((x ^ y) as u8)]))
    }

    fn at(s: &str) -> DateTime<Utc> {
        Utc.from_utc_datetime(&NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap())
    }

    #[test]
    fn test_sample_file_name() {
        let ts = at("20261019_101500");
        assert_eq!(sample_file_name(IdentityId(12), ts, 0), "student_12_20261019_101500.png");
        assert_eq!(sample_file_name(IdentityId(12), ts, 2), "student_12_20261019_101500_2.png");
    }

    #[test]
    fn test_parse_sample_name() {
        let (id, ts) = parse_sample_name("student_12_20261019_101500.png").unwrap();
        assert_eq!(id, IdentityId(12));
        assert_eq!(ts, at("20261019_101500"));

        assert!(parse_sample_name("student_12_20261019_101500_3.png").is_some());
        let (id, ts) = parse_sample_name("student_7_20240101_000000.jpg").unwrap();
        assert_eq!(id, IdentityId(7));
        let local = NaiveDateTime::parse_from_str("20240101_000000", TIMESTAMP_FORMAT).unwrap();
        assert_eq!(ts, Local.from_local_datetime(&local).earliest().unwrap().with_timezone(&Utc));

        for bad in [
            "student_x_20261019_101500.png",
            "student_12_2026_101500.png",
            "student_12_20261019_101500.txt",
            "staff_12_20261019_101500.png",
            "student_12_20261019_101500_a.png",
            "student_12.png",
            "index.json",
        ] {
            assert!(parse_sample_name(bad).is_none(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_open_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path().join("face_data")).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.all().count(), 0);
    }

    #[test]
    fn test_add_creates_dir_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("face_data");
        let mut store = SampleStore::open(&data).unwrap();

        let sample = store.add_at(IdentityId(3), &region(10), at("20261019_090000")).unwrap();
        assert_eq!(sample.file_name, "student_3_20261019_090000.png");
        assert!(data.join(&sample.file_name).exists());
        assert!(data.join(INDEX_FILE).exists());

        let loaded: Vec<_> = store.all().collect();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, IdentityId(3));
        assert_eq!(loaded[0].1, region(10));
    }

    #[test]
    fn test_same_second_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SampleStore::open(dir.path()).unwrap();
        let ts = at("20261019_090000");

        let first = store.add_at(IdentityId(3), &region(10), ts).unwrap();
        let second = store.add_at(IdentityId(3), &region(90), ts).unwrap();
        assert_ne!(first.file_name, second.file_name);
        assert_eq!(second.file_name, "student_3_20261019_090000_1.png");
        assert_eq!(store.samples_for(IdentityId(3)).count(), 2);

        let regions: Vec<GrayImage> = store.all().map(|(_, r)| r).collect();
        assert_eq!(regions, vec![region(10), region(90)]);
    }

    #[test]
    fn test_reopen_uses_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = SampleStore::open(dir.path()).unwrap();
            store.add_at(IdentityId(1), &region(1), at("20261019_090000")).unwrap();
            store.add_at(IdentityId(2), &region(2), at("20261019_090001")).unwrap();
        }
        let store = SampleStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.identities(), vec![IdentityId(1), IdentityId(2)]);
    }

    #[test]
    fn test_rebuild_without_index_skips_malformed_names() {
        let dir = tempfile::tempdir().unwrap();
        region(5).save(dir.path().join("student_4_20240101_120000.jpg")).unwrap();
        region(6).save(dir.path().join("student_9_20231230_110000.png")).unwrap();
        region(7).save(dir.path().join("selfie.png")).unwrap();
        region(8).save(dir.path().join("student_abc_20240101_110000.png")).unwrap();

        let store = SampleStore::open(dir.path()).unwrap();
        let ids: Vec<IdentityId> = store.samples().iter().map(|s| s.identity_id).collect();
        // Ordered by capture time.
        assert_eq!(ids, vec![IdentityId(9), IdentityId(4)]);
        assert_eq!(store.all().count(), 2);
        assert!(dir.path().join(INDEX_FILE).exists());
    }

    #[test]
    fn test_corrupt_index_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = SampleStore::open(dir.path()).unwrap();
            store.add_at(IdentityId(1), &region(1), at("20261019_090000")).unwrap();
        }
        std::fs::write(dir.path().join(INDEX_FILE), b"{ not json").unwrap();

        let store = SampleStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.samples()[0].identity_id, IdentityId(1));
    }

    #[test]
    fn test_unreadable_sample_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SampleStore::open(dir.path()).unwrap();
        let bad = store.add_at(IdentityId(1), &region(1), at("20261019_090000")).unwrap();
        store.add_at(IdentityId(2), &region(2), at("20261019_090001")).unwrap();
        std::fs::write(dir.path().join(&bad.file_name), b"garbage").unwrap();

        let loaded: Vec<IdentityId> = store.all().map(|(id, _)| id).collect();
        assert_eq!(loaded, vec![IdentityId(2)]);
    }
}
