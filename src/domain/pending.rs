//! Pending uploads: captures with a local file but no confirmed remote copy.
//!
//! A `PendingUploadRecord` is written to the durable store the instant a
//! capture finishes, before any network call, and survives process
//! termination. It is the recovery seed after a crash or kill mid-upload.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What initiated the upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadTrigger {
    /// A finished microphone capture
    Recording,

    /// Re-recording over an existing lecture
    Retake,

    /// User picked an existing audio file
    FilePick,
}

/// Durable record of a capture awaiting confirmed upload.
///
/// Removed only when the upload is acknowledged by both blob store and
/// document store, or when the user explicitly discards the lecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUploadRecord {
    pub lecture_id: Uuid,

    pub user_id: String,

    pub title: String,

    pub captured_at: DateTime<Utc>,

    /// Estimated duration in minutes, when known at capture time
    pub duration_estimate_minutes: Option<u32>,

    /// Target path in the remote blob store
    pub remote_audio_path: String,

    /// Local source file awaiting upload
    pub local_path: PathBuf,

    pub trigger: UploadTrigger,

    /// Set once the blob write has been acknowledged. A later retry with
    /// this flag set skips straight to metadata finalize.
    #[serde(default)]
    pub blob_uploaded: bool,

    /// Content identity of the uploaded bytes, stable across retries
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl PendingUploadRecord {
    pub fn new(
        lecture_id: Uuid,
        user_id: impl Into<String>,
        title: impl Into<String>,
        captured_at: DateTime<Utc>,
        local_path: PathBuf,
        trigger: UploadTrigger,
    ) -> Self {
        let user_id = user_id.into();
        let remote_audio_path = Self::remote_path_for(&user_id, lecture_id);

        Self {
            lecture_id,
            user_id,
            title: title.into(),
            captured_at,
            duration_estimate_minutes: None,
            remote_audio_path,
            local_path,
            trigger,
            blob_uploaded: false,
            content_hash: None,
        }
    }

    /// Blob paths are stable per lecture id, so retries overwrite rather
    /// than duplicate.
    pub fn remote_path_for(user_id: &str, lecture_id: Uuid) -> String {
        format!("audio/{}/{}.m4a", user_id, lecture_id)
    }
}

/// Runtime wrapper around a pending record plus any prepared intermediate
/// file. One entry per lecture id; exists only while an upload is
/// outstanding or retriable.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub record: PendingUploadRecord,

    /// Transcoded canonical-container file, when preparation has run
    pub prepared_file: Option<PathBuf>,
}

impl PendingUpload {
    pub fn new(record: PendingUploadRecord) -> Self {
        Self {
            record,
            prepared_file: None,
        }
    }

    /// The best available source for a retry: the prepared intermediate
    /// first, then the recorded/picked file if it still exists.
    pub fn recoverable_source(&self) -> Option<PathBuf> {
        if let Some(ref prepared) = self.prepared_file {
            if prepared.exists() {
                return Some(prepared.clone());
            }
        }

        if self.record.local_path.exists() {
            return Some(self.record.local_path.clone());
        }

        None
    }
}
