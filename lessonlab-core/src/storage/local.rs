//! Local write-ahead cache.
//!
//! One JSON file per key under a per-participant directory:
//!
//! ```text
//! <root>/<participant>/context.json
//! <root>/<participant>/records/<item>.json
//! <root>/<participant>/survey-<kind>.json
//! ```
//!
//! Files are replaced atomically and read independently, so one corrupt
//! file never hides the others.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{PersistenceEnvelope, Result, Tier};
use crate::record::{SessionRecord, SurveyKind, SurveyResponse};
use crate::types::{ItemId, ParticipantId};

const RECORDS_DIR: &str = "records";

/// Identifies one file in a participant's cache directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Context,
    Record(ItemId),
    Survey(SurveyKind),
}

impl CacheKey {
    fn relative_path(&self) -> PathBuf {
        match self {
            Self::Context => PathBuf::from("context.json"),
            Self::Record(item) => Path::new(RECORDS_DIR).join(format!("{}.json", item.0)),
            Self::Survey(kind) => PathBuf::from(format!("survey-{}.json", kind.as_str())),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Context => f.write_str("context"),
            Self::Record(item) => write!(f, "record {}", item),
            Self::Survey(kind) => write!(f, "{} survey", kind.as_str()),
        }
    }
}

/// A cached payload plus its envelope and remote confirmation status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub payload: T,
    pub envelope: PersistenceEnvelope,
    /// Remote tier that has acknowledged this exact payload, if any.
    #[serde(default)]
    pub confirmed_by: Option<Tier>,
}

impl<T> CacheEntry<T> {
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_by.is_some()
    }
}

/// Directory-backed cache written before any remote attempt.
#[derive(Debug, Clone)]
pub struct LocalCache {
    root: PathBuf,
}

impl LocalCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing `key` for `participant`.
    #[must_use]
    pub fn path_for(&self, participant: &ParticipantId, key: CacheKey) -> PathBuf {
        self.participant_dir(participant).join(key.relative_path())
    }

    fn participant_dir(&self, participant: &ParticipantId) -> PathBuf {
        self.root.join(participant.cache_key())
    }

    /// Atomically replace the file for `key`.
    pub fn write<T: Serialize>(
        &self,
        participant: &ParticipantId,
        key: CacheKey,
        entry: &CacheEntry<T>,
    ) -> Result<()> {
        let path = self.path_for(participant, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec_pretty(entry)?;
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        debug!(participant = %participant, %key, "wrote local cache entry");
        Ok(())
    }

    /// Read the entry for `key`.
    ///
    /// A missing file yields `None`. So does a corrupt one, after a warning.
    pub fn read<T: DeserializeOwned>(
        &self,
        participant: &ParticipantId,
        key: CacheKey,
    ) -> Result<Option<CacheEntry<T>>> {
        read_entry(&self.path_for(participant, key))
    }

    /// Every readable record entry for `participant`, ordered by item id.
    pub fn read_records(
        &self,
        participant: &ParticipantId,
    ) -> Result<Vec<CacheEntry<SessionRecord>>> {
        let dir = self.participant_dir(participant).join(RECORDS_DIR);
        let listing = match fs::read_dir(&dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for dir_entry in listing {
            let path = dir_entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(entry) = read_entry::<SessionRecord>(&path)? {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|entry| entry.payload.item_id);
        Ok(entries)
    }

    /// Every readable survey entry for `participant`.
    pub fn read_surveys(
        &self,
        participant: &ParticipantId,
    ) -> Result<Vec<CacheEntry<SurveyResponse>>> {
        let mut entries = Vec::new();
        for kind in [SurveyKind::Pre, SurveyKind::Post] {
            if let Some(entry) = self.read(participant, CacheKey::Survey(kind))? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

fn read_entry<T: DeserializeOwned>(path: &Path) -> Result<Option<CacheEntry<T>>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice(&bytes) {
        Ok(entry) => Ok(Some(entry)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping corrupt local cache entry");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::condition::Condition;
    use crate::record::RecordPhase;
    use crate::storage::payload_hash;

    fn participant() -> ParticipantId {
        ParticipantId::parse("p/7").unwrap()
    }

    fn entry(item: u32) -> CacheEntry<SessionRecord> {
        let record = SessionRecord::new(
            ItemId(item),
            "Simplify 6/8",
            RecordPhase::Lesson,
            Condition::Group,
            Utc::now(),
        );
        let hash = payload_hash(&record).unwrap();
        CacheEntry {
            payload: record,
            envelope: PersistenceEnvelope::new(Tier::LocalCache, 1, hash, Utc::now()),
            confirmed_by: None,
        }
    }

    #[test]
    fn keys_map_to_documented_layout() {
        let cache = LocalCache::new("/cache");
        let p = ParticipantId::parse("p1").unwrap();
        assert_eq!(
            cache.path_for(&p, CacheKey::Context),
            PathBuf::from("/cache/p1/context.json")
        );
        assert_eq!(
            cache.path_for(&p, CacheKey::Record(ItemId(5))),
            PathBuf::from("/cache/p1/records/5.json")
        );
        assert_eq!(
            cache.path_for(&p, CacheKey::Survey(SurveyKind::Post)),
            PathBuf::from("/cache/p1/survey-post.json")
        );
    }

    #[test]
    fn participant_directory_is_escaped() {
        let cache = LocalCache::new("/cache");
        let path = cache.path_for(&participant(), CacheKey::Context);
        assert!(!path.to_string_lossy().contains("p/7"));
    }

    #[test]
    fn write_then_read_returns_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        let written = entry(5);

        cache
            .write(&participant(), CacheKey::Record(ItemId(5)), &written)
            .unwrap();
        let read: CacheEntry<SessionRecord> = cache
            .read(&participant(), CacheKey::Record(ItemId(5)))
            .unwrap()
            .unwrap();

        assert_eq!(read, written);
        assert!(!read.is_confirmed());
    }

    #[test]
    fn missing_entry_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        let read: Option<CacheEntry<SessionRecord>> =
            cache.read(&participant(), CacheKey::Context).unwrap();
        assert!(read.is_none());
        assert!(cache.read_records(&participant()).unwrap().is_empty());
    }

    #[test]
    fn corrupt_record_is_skipped_but_others_survive() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        cache
            .write(&participant(), CacheKey::Record(ItemId(2)), &entry(2))
            .unwrap();
        cache
            .write(&participant(), CacheKey::Record(ItemId(4)), &entry(4))
            .unwrap();
        fs::write(
            cache.path_for(&participant(), CacheKey::Record(ItemId(4))),
            b"{ not json",
        )
        .unwrap();

        let records = cache.read_records(&participant()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload.item_id, ItemId(2));
    }

    #[test]
    fn records_are_sorted_and_temp_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        for item in [7, 1, 3] {
            cache
                .write(&participant(), CacheKey::Record(ItemId(item)), &entry(item))
                .unwrap();
        }
        let stray = cache
            .path_for(&participant(), CacheKey::Record(ItemId(9)))
            .with_extension("json.tmp");
        fs::write(stray, b"partial").unwrap();

        let items: Vec<u32> = cache
            .read_records(&participant())
            .unwrap()
            .iter()
            .map(|e| e.payload.item_id.0)
            .collect();
        assert_eq!(items, vec![1, 3, 7]);
    }

    #[test]
    fn write_fails_when_root_is_a_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let cache = LocalCache::new(file.path());
        let result = cache.write(&participant(), CacheKey::Record(ItemId(1)), &entry(1));
        assert!(result.is_err());
    }
}
