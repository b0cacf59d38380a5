//! External collaborator seams: document store, blob store, auth.
//!
//! The client never talks to the transcription or summarization backends
//! directly; it only observes status fields a server-side process
//! mutates. These traits are the full surface the core depends on, with
//! an HTTP implementation for production and an in-process one for tests
//! and offline development.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::{Folder, Lecture, LecturePatch, UsageQuota};

pub use http::HttpRemote;
pub use memory::MemoryRemote;

/// Errors crossing the remote boundary
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Quota exceeded: {reason}")]
    Quota { reason: String },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Request rejected ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("Remote error: {0}")]
    Unknown(String),
}

impl RemoteError {
    /// Whether a retry within the same upload lifecycle may succeed.
    /// Unknown errors are non-retryable; surfacing beats looping.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::Server { .. }
        )
    }
}

/// Per-user collection of lecture documents with live snapshots.
///
/// Writes are field-level merge-upserts: absent patch fields keep their
/// remote value, so finalize is idempotent and safe to re-invoke.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Merge-upsert a lecture document
    async fn put_lecture(
        &self,
        user_id: &str,
        lecture_id: Uuid,
        patch: &LecturePatch,
    ) -> Result<(), RemoteError>;

    async fn delete_lecture(&self, user_id: &str, lecture_id: Uuid) -> Result<(), RemoteError>;

    /// One snapshot of all lectures, sorted by creation date descending
    async fn fetch_lectures(&self, user_id: &str) -> Result<Vec<Lecture>, RemoteError>;

    /// Live snapshot feed. Snapshots arrive in order and must be
    /// processed in that order.
    fn subscribe(&self, user_id: &str) -> mpsc::UnboundedReceiver<Vec<Lecture>>;

    /// The user-profile document (plan, usage counters)
    async fn fetch_profile(&self, user_id: &str) -> Result<UsageQuota, RemoteError>;

    async fn put_folder(&self, user_id: &str, folder: &Folder) -> Result<(), RemoteError>;

    async fn fetch_folders(&self, user_id: &str) -> Result<Vec<Folder>, RemoteError>;
}

/// Content upload by path and resolution to a time-limited download URL
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), RemoteError>;

    async fn download_url(&self, path: &str) -> Result<String, RemoteError>;
}

/// Anonymous identity and token management
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Sign in anonymously, yielding a stable user id
    async fn sign_in_anonymously(&self) -> Result<String, RemoteError>;

    /// Current bearer token, optionally force-refreshed
    async fn id_token(&self, force_refresh: bool) -> Result<String, RemoteError>;

    async fn sign_out(&self) -> Result<(), RemoteError>;
}
