//! Durable, user-scoped persistence of pending-upload records.
//!
//! One JSON snapshot file per user. Every mutation reads the full
//! snapshot first, applies the change, and writes the result back
//! atomically (temp file + rename) under an exclusive advisory lock.
//! The store does no file-existence validation of the recorded audio
//! paths; that is the orchestrator's job on load.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::PendingUploadRecord;

/// Errors from the pending-upload store
#[derive(Debug, Error)]
pub enum PendingStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to persist snapshot: {0}")]
    Persist(String),
}

/// On-disk snapshot schema
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    records: Vec<PendingUploadRecord>,
}

/// Per-user JSON snapshot store of `PendingUploadRecord`s
pub struct PendingStore {
    base_dir: PathBuf,
}

impl PendingStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Open the store in the configured location ($LECTERN_HOME/pending)
    pub fn open_default() -> anyhow::Result<Self> {
        Ok(Self::new(crate::config::pending_dir()?))
    }

    fn user_path(&self, user_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", user_id))
    }

    fn lock_path(&self, user_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.lock", user_id))
    }

    /// Take the per-user exclusive lock. Released when the guard drops.
    fn lock(&self, user_id: &str) -> Result<File, PendingStoreError> {
        fs::create_dir_all(&self.base_dir)?;
        let lock_file = File::create(self.lock_path(user_id))?;
        lock_file.lock_exclusive()?;
        Ok(lock_file)
    }

    fn read_snapshot(&self, path: &Path) -> Result<Snapshot, PendingStoreError> {
        if !path.exists() {
            return Ok(Snapshot::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_snapshot(&self, path: &Path, snapshot: &Snapshot) -> Result<(), PendingStoreError> {
        let json = serde_json::to_string_pretty(snapshot)?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.base_dir)?;
        std::io::Write::write_all(&mut temp, json.as_bytes())?;
        temp.persist(path)
            .map_err(|e| PendingStoreError::Persist(e.to_string()))?;

        Ok(())
    }

    /// Insert or replace the record with the same lecture id
    pub fn upsert(&self, record: &PendingUploadRecord) -> Result<(), PendingStoreError> {
        let _guard = self.lock(&record.user_id)?;
        let path = self.user_path(&record.user_id);

        let mut snapshot = self.read_snapshot(&path)?;
        if let Some(existing) = snapshot
            .records
            .iter_mut()
            .find(|r| r.lecture_id == record.lecture_id)
        {
            *existing = record.clone();
        } else {
            snapshot.records.push(record.clone());
        }

        self.write_snapshot(&path, &snapshot)
    }

    /// Remove the record for a lecture id, if present
    pub fn remove(&self, lecture_id: Uuid, user_id: &str) -> Result<(), PendingStoreError> {
        let _guard = self.lock(user_id)?;
        let path = self.user_path(user_id);

        let mut snapshot = self.read_snapshot(&path)?;
        snapshot.records.retain(|r| r.lecture_id != lecture_id);

        self.write_snapshot(&path, &snapshot)
    }

    /// Load all records for a user
    pub fn load(&self, user_id: &str) -> Result<Vec<PendingUploadRecord>, PendingStoreError> {
        let _guard = self.lock(user_id)?;
        Ok(self.read_snapshot(&self.user_path(user_id))?.records)
    }

    /// Replace the full record set for a user
    pub fn replace(
        &self,
        records: &[PendingUploadRecord],
        user_id: &str,
    ) -> Result<(), PendingStoreError> {
        let _guard = self.lock(user_id)?;
        let snapshot = Snapshot {
            version: 1,
            records: records.to_vec(),
        };
        self.write_snapshot(&self.user_path(user_id), &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UploadTrigger;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(user: &str, title: &str) -> PendingUploadRecord {
        PendingUploadRecord::new(
            Uuid::new_v4(),
            user,
            title,
            Utc::now(),
            PathBuf::from("/tmp/audio.wav"),
            UploadTrigger::Recording,
        )
    }

    #[test]
    fn test_upsert_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = PendingStore::new(temp.path().to_path_buf());

        let rec = record("user-1", "Talk A");
        store.upsert(&rec).unwrap();

        let loaded = store.load("user-1").unwrap();
        assert_eq!(loaded, vec![rec]);
    }

    #[test]
    fn test_upsert_replaces_same_lecture_id() {
        let temp = TempDir::new().unwrap();
        let store = PendingStore::new(temp.path().to_path_buf());

        let mut rec = record("user-1", "Talk A");
        store.upsert(&rec).unwrap();

        rec.blob_uploaded = true;
        store.upsert(&rec).unwrap();

        let loaded = store.load("user-1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].blob_uploaded);
    }

    #[test]
    fn test_remove() {
        let temp = TempDir::new().unwrap();
        let store = PendingStore::new(temp.path().to_path_buf());

        let rec_a = record("user-1", "Talk A");
        let rec_b = record("user-1", "Talk B");
        store.upsert(&rec_a).unwrap();
        store.upsert(&rec_b).unwrap();

        store.remove(rec_a.lecture_id, "user-1").unwrap();

        let loaded = store.load("user-1").unwrap();
        assert_eq!(loaded, vec![rec_b]);
    }

    #[test]
    fn test_users_are_isolated() {
        let temp = TempDir::new().unwrap();
        let store = PendingStore::new(temp.path().to_path_buf());

        store.upsert(&record("user-1", "Talk A")).unwrap();
        store.upsert(&record("user-2", "Talk B")).unwrap();

        assert_eq!(store.load("user-1").unwrap().len(), 1);
        assert_eq!(store.load("user-2").unwrap().len(), 1);
        assert_eq!(store.load("user-3").unwrap().len(), 0);
    }

    #[test]
    fn test_replace_overwrites_everything() {
        let temp = TempDir::new().unwrap();
        let store = PendingStore::new(temp.path().to_path_buf());

        store.upsert(&record("user-1", "Talk A")).unwrap();
        store.upsert(&record("user-1", "Talk B")).unwrap();

        let survivor = record("user-1", "Talk C");
        store.replace(&[survivor.clone()], "user-1").unwrap();

        assert_eq!(store.load("user-1").unwrap(), vec![survivor]);
    }
}
