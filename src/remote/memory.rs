//! In-process implementation of the remote seams.
//!
//! Documents are stored as raw JSON objects so merge-upsert semantics
//! match the real backend: a patch only touches the fields it carries.
//! Tests can script blob-upload failures and inspect call counters.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::{Folder, Lecture, LectureDocument, LecturePatch, UsageQuota};

use super::{AuthProvider, BlobStore, DocumentStore, RemoteError};

#[derive(Default)]
struct MemoryState {
    /// user id -> lecture id -> raw document object
    documents: HashMap<String, HashMap<Uuid, Value>>,
    /// blob path -> content
    blobs: HashMap<String, Vec<u8>>,
    folders: HashMap<String, Vec<Folder>>,
    profiles: HashMap<String, UsageQuota>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Vec<Lecture>>>>,
    /// Scripted errors popped by the next blob uploads
    upload_failures: VecDeque<RemoteError>,
    /// Scripted errors popped by the next merge-upserts
    put_lecture_failures: VecDeque<RemoteError>,
    upload_attempts: u32,
    put_lecture_calls: u32,
}

/// Memory-backed document store, blob store and auth provider
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next blob uploads to fail with the given errors, in order
    pub fn fail_next_uploads(&self, errors: Vec<RemoteError>) {
        self.state.lock().unwrap().upload_failures.extend(errors);
    }

    /// Script the next merge-upserts to fail with the given errors, in order
    pub fn fail_next_put_lectures(&self, errors: Vec<RemoteError>) {
        self.state
            .lock()
            .unwrap()
            .put_lecture_failures
            .extend(errors);
    }

    /// Total blob-upload attempts observed (including scripted failures)
    pub fn upload_attempts(&self) -> u32 {
        self.state.lock().unwrap().upload_attempts
    }

    /// Total merge-upserts observed
    pub fn put_lecture_calls(&self) -> u32 {
        self.state.lock().unwrap().put_lecture_calls
    }

    pub fn blob_exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().blobs.contains_key(path)
    }

    /// Raw document for assertions on merge behavior
    pub fn raw_document(&self, user_id: &str, lecture_id: Uuid) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .documents
            .get(user_id)
            .and_then(|docs| docs.get(&lecture_id))
            .cloned()
    }

    /// Replace a document wholesale, as a server-side process would when
    /// publishing transcription/summarization results.
    pub fn set_document(&self, user_id: &str, lecture_id: Uuid, document: Value) {
        self.state
            .lock()
            .unwrap()
            .documents
            .entry(user_id.to_string())
            .or_default()
            .insert(lecture_id, document);
    }

    pub fn set_profile(&self, user_id: &str, quota: UsageQuota) {
        self.state
            .lock()
            .unwrap()
            .profiles
            .insert(user_id.to_string(), quota);
    }

    fn snapshot_locked(state: &MemoryState, user_id: &str) -> Vec<Lecture> {
        let mut lectures: Vec<Lecture> = state
            .documents
            .get(user_id)
            .map(|docs| {
                docs.values()
                    .filter_map(|value| {
                        serde_json::from_value::<LectureDocument>(value.clone())
                            .ok()
                            .and_then(|d| d.decode())
                    })
                    .collect()
            })
            .unwrap_or_default();

        lectures.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        lectures
    }

    /// Deliver the current snapshot to all subscribers for a user
    pub fn emit_snapshot(&self, user_id: &str) {
        let mut state = self.state.lock().unwrap();
        let snapshot = Self::snapshot_locked(&state, user_id);

        if let Some(senders) = state.subscribers.get_mut(user_id) {
            senders.retain(|tx| tx.send(snapshot.clone()).is_ok());
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryRemote {
    async fn put_lecture(
        &self,
        user_id: &str,
        lecture_id: Uuid,
        patch: &LecturePatch,
    ) -> Result<(), RemoteError> {
        let patch_value = serde_json::to_value(patch)
            .map_err(|e| RemoteError::Unknown(e.to_string()))?;

        let mut state = self.state.lock().unwrap();
        state.put_lecture_calls += 1;

        if let Some(error) = state.put_lecture_failures.pop_front() {
            return Err(error);
        }

        let doc = state
            .documents
            .entry(user_id.to_string())
            .or_default()
            .entry(lecture_id)
            .or_insert_with(|| serde_json::json!({ "id": lecture_id.to_string() }));

        // Field-level merge: only the fields present in the patch change
        if let (Value::Object(doc), Value::Object(fields)) = (doc, patch_value) {
            for (key, value) in fields {
                doc.insert(key, value);
            }
        }

        Ok(())
    }

    async fn delete_lecture(&self, user_id: &str, lecture_id: Uuid) -> Result<(), RemoteError> {
        if let Some(docs) = self.state.lock().unwrap().documents.get_mut(user_id) {
            docs.remove(&lecture_id);
        }
        Ok(())
    }

    async fn fetch_lectures(&self, user_id: &str) -> Result<Vec<Lecture>, RemoteError> {
        let state = self.state.lock().unwrap();
        Ok(Self::snapshot_locked(&state, user_id))
    }

    fn subscribe(&self, user_id: &str) -> mpsc::UnboundedReceiver<Vec<Lecture>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .unwrap()
            .subscribers
            .entry(user_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<UsageQuota, RemoteError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .profiles
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_folder(&self, user_id: &str, folder: &Folder) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        let folders = state.folders.entry(user_id.to_string()).or_default();

        if let Some(existing) = folders.iter_mut().find(|f| f.id == folder.id) {
            *existing = folder.clone();
        } else {
            folders.push(folder.clone());
        }

        Ok(())
    }

    async fn fetch_folders(&self, user_id: &str) -> Result<Vec<Folder>, RemoteError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .folders
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl BlobStore for MemoryRemote {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.upload_attempts += 1;

        if let Some(error) = state.upload_failures.pop_front() {
            return Err(error);
        }

        state.blobs.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn download_url(&self, path: &str) -> Result<String, RemoteError> {
        if self.state.lock().unwrap().blobs.contains_key(path) {
            Ok(format!("memory://{}", path))
        } else {
            Err(RemoteError::Client {
                status: 404,
                message: format!("no blob at {}", path),
            })
        }
    }
}

#[async_trait]
impl AuthProvider for MemoryRemote {
    async fn sign_in_anonymously(&self) -> Result<String, RemoteError> {
        Ok(format!("anon-{}", Uuid::new_v4()))
    }

    async fn id_token(&self, _force_refresh: bool) -> Result<String, RemoteError> {
        Ok("memory-token".to_string())
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LectureStatus;
    use chrono::Utc;

    #[tokio::test]
    async fn test_merge_upsert_preserves_untouched_fields() {
        let remote = MemoryRemote::new();
        let id = Uuid::new_v4();

        let create = LecturePatch::finalize(
            "Talk".to_string(),
            Utc::now(),
            Some(12),
            "audio/u1/x.m4a".to_string(),
        );
        remote.put_lecture("u1", id, &create).await.unwrap();

        // A later status-only patch must not clobber the audio path
        let fail = LecturePatch::failed("boom".to_string());
        remote.put_lecture("u1", id, &fail).await.unwrap();

        let lectures = remote.fetch_lectures("u1").await.unwrap();
        assert_eq!(lectures.len(), 1);
        assert_eq!(lectures[0].status, LectureStatus::Failed);
        assert_eq!(lectures[0].audio_path.as_deref(), Some("audio/u1/x.m4a"));
        assert_eq!(lectures[0].duration_minutes, Some(12));
    }

    #[tokio::test]
    async fn test_put_lecture_is_idempotent() {
        let remote = MemoryRemote::new();
        let id = Uuid::new_v4();

        let patch = LecturePatch::finalize(
            "Talk".to_string(),
            Utc::now(),
            Some(5),
            "audio/u1/y.m4a".to_string(),
        );

        remote.put_lecture("u1", id, &patch).await.unwrap();
        let first = remote.raw_document("u1", id).unwrap();

        remote.put_lecture("u1", id, &patch).await.unwrap();
        let second = remote.raw_document("u1", id).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_scripted_upload_failures() {
        let remote = MemoryRemote::new();
        remote.fail_next_uploads(vec![RemoteError::Network("reset".into())]);

        let err = remote
            .upload("audio/u1/z.m4a", vec![1, 2, 3], "audio/mp4")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!remote.blob_exists("audio/u1/z.m4a"));

        remote
            .upload("audio/u1/z.m4a", vec![1, 2, 3], "audio/mp4")
            .await
            .unwrap();
        assert!(remote.blob_exists("audio/u1/z.m4a"));
        assert_eq!(remote.upload_attempts(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_ordering_and_subscription() {
        let remote = MemoryRemote::new();
        let mut rx = remote.subscribe("u1");

        let older = Uuid::new_v4();
        let newer = Uuid::new_v4();
        let base = Utc::now();

        remote
            .put_lecture(
                "u1",
                older,
                &LecturePatch::finalize(
                    "Older".to_string(),
                    base - chrono::Duration::hours(1),
                    None,
                    "audio/u1/a.m4a".to_string(),
                ),
            )
            .await
            .unwrap();
        remote
            .put_lecture(
                "u1",
                newer,
                &LecturePatch::finalize(
                    "Newer".to_string(),
                    base,
                    None,
                    "audio/u1/b.m4a".to_string(),
                ),
            )
            .await
            .unwrap();

        remote.emit_snapshot("u1");

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, newer);
        assert_eq!(snapshot[1].id, older);
    }

    #[tokio::test]
    async fn test_malformed_documents_are_dropped() {
        let remote = MemoryRemote::new();
        let good = Uuid::new_v4();

        remote.set_document(
            "u1",
            good,
            serde_json::json!({
                "id": good.to_string(),
                "title": "Good",
                "created_at": Utc::now(),
                "status": "ready",
            }),
        );
        remote.set_document(
            "u1",
            Uuid::new_v4(),
            serde_json::json!({ "id": "not-a-uuid", "title": 42 }),
        );

        let lectures = remote.fetch_lectures("u1").await.unwrap();
        assert_eq!(lectures.len(), 1);
        assert_eq!(lectures[0].id, good);
    }
}
