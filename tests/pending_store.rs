//! Pending Store Integration Tests
//!
//! Round-trip and recovery-oriented behavior of the durable
//! pending-upload store.

use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use lectern::domain::{PendingUploadRecord, UploadTrigger};
use lectern::store::PendingStore;
use tempfile::TempDir;
use uuid::Uuid;

fn record(user: &str) -> PendingUploadRecord {
    let mut record = PendingUploadRecord::new(
        Uuid::new_v4(),
        user,
        "Jumu'ah Talk",
        Utc.with_ymd_and_hms(2024, 6, 14, 13, 5, 0).unwrap(),
        PathBuf::from("/captures/talk.wav"),
        UploadTrigger::Recording,
    );
    record.duration_estimate_minutes = Some(42);
    record
}

#[test]
fn test_round_trip_is_field_identical() {
    let temp = TempDir::new().unwrap();
    let store = PendingStore::new(temp.path().to_path_buf());

    let original = record("user-1");
    store.upsert(&original).unwrap();

    let loaded = store.load("user-1").unwrap();
    assert_eq!(loaded.len(), 1);

    let restored = &loaded[0];
    assert_eq!(restored.lecture_id, original.lecture_id);
    assert_eq!(restored.user_id, original.user_id);
    assert_eq!(restored.title, original.title);
    assert_eq!(restored.captured_at, original.captured_at);
    assert_eq!(
        restored.duration_estimate_minutes,
        original.duration_estimate_minutes
    );
    assert_eq!(restored.remote_audio_path, original.remote_audio_path);
    assert_eq!(restored.local_path, original.local_path);
    assert_eq!(restored.trigger, original.trigger);
    assert_eq!(restored.blob_uploaded, original.blob_uploaded);
    assert_eq!(restored.content_hash, original.content_hash);
}

#[test]
fn test_store_survives_reopen() {
    let temp = TempDir::new().unwrap();

    let original = record("user-1");
    {
        let store = PendingStore::new(temp.path().to_path_buf());
        store.upsert(&original).unwrap();
    }

    // A fresh store instance over the same directory sees the data
    let store = PendingStore::new(temp.path().to_path_buf());
    assert_eq!(store.load("user-1").unwrap(), vec![original]);
}

#[test]
fn test_blob_uploaded_flag_persists_across_upserts() {
    let temp = TempDir::new().unwrap();
    let store = PendingStore::new(temp.path().to_path_buf());

    let mut rec = record("user-1");
    store.upsert(&rec).unwrap();

    rec.blob_uploaded = true;
    store.upsert(&rec).unwrap();

    let loaded = store.load("user-1").unwrap();
    assert_eq!(loaded.len(), 1);
    assert!(loaded[0].blob_uploaded);
}

#[test]
fn test_replace_is_the_recovery_write_back() {
    let temp = TempDir::new().unwrap();
    let store = PendingStore::new(temp.path().to_path_buf());

    let keep = record("user-1");
    let drop_me = record("user-1");
    store.upsert(&keep).unwrap();
    store.upsert(&drop_me).unwrap();

    // Recovery decided only one record is still recoverable
    store.replace(std::slice::from_ref(&keep), "user-1").unwrap();

    let loaded = store.load("user-1").unwrap();
    assert_eq!(loaded, vec![keep]);
}

#[test]
fn test_remove_unknown_id_is_harmless() {
    let temp = TempDir::new().unwrap();
    let store = PendingStore::new(temp.path().to_path_buf());

    let rec = record("user-1");
    store.upsert(&rec).unwrap();
    store.remove(Uuid::new_v4(), "user-1").unwrap();

    assert_eq!(store.load("user-1").unwrap().len(), 1);
}
