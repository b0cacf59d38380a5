//! Upload orchestrator: local audio file to confirmed remote blob plus
//! metadata document, exactly-once in effect despite retries.
//!
//! Per-lecture invariant: at most one upload is active at a time. The
//! pending record is persisted before the first network call and removed
//! only when both blob store and document store have acknowledged, so a
//! killed process can resume from the store on next startup.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Policy;
use crate::domain::{
    Lecture, LecturePatch, LectureStatus, PendingUpload, PendingUploadRecord, UploadTrigger,
};
use crate::remote::{BlobStore, DocumentStore, RemoteError};
use crate::store::{PendingStore, PendingStoreError};
use crate::telemetry::{PhaseErrorCode, PipelineTelemetryLedger};

use super::prepare::{self, PreparationError, CANONICAL_CONTENT_TYPE};
use super::retry::RetryPolicy;

/// Errors surfaced by the upload pipeline
#[derive(Debug, Error)]
pub enum UploadError {
    /// A second concurrent attempt for an id that already has an active
    /// upload; rejected, never queued
    #[error("An upload is already in flight for lecture {0}")]
    AlreadyInFlight(Uuid),

    #[error(transparent)]
    Preparation(#[from] PreparationError),

    /// The transient-failure budget is spent
    #[error("Upload failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    /// A terminal remote failure (auth, quota, 4xx)
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Manual retry requested but neither a prepared file, the recorded
    /// file, nor the original source is reachable
    #[error("No recoverable source for lecture {0}")]
    NoRecoverableSource(Uuid),

    #[error(transparent)]
    Store(#[from] PendingStoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Stable, user-presentable message stored on the failed lecture
    pub fn user_message(&self) -> String {
        match self {
            Self::AlreadyInFlight(_) => "This recording is already uploading".to_string(),
            Self::Preparation(e) => e.to_string(),
            Self::RetriesExhausted { .. } => {
                "Upload failed after several attempts. Check your connection and retry".to_string()
            }
            Self::Remote(RemoteError::Auth(_)) => "Sign-in expired. Please try again".to_string(),
            Self::Remote(RemoteError::Quota { reason }) => {
                format!("Processing quota reached ({})", reason)
            }
            Self::Remote(_) => "Upload failed. Please retry".to_string(),
            Self::NoRecoverableSource(_) => {
                "The original recording is no longer available".to_string()
            }
            Self::Store(_) | Self::Io(_) => "Could not access local storage".to_string(),
        }
    }

    fn telemetry_code(&self) -> PhaseErrorCode {
        match self {
            Self::Preparation(e) => PhaseErrorCode::from_preparation(e),
            Self::RetriesExhausted { source, .. } => PhaseErrorCode::from_remote(source),
            Self::Remote(e) => PhaseErrorCode::from_remote(e),
            Self::NoRecoverableSource(_) => PhaseErrorCode::InvalidMedia,
            Self::AlreadyInFlight(_) => PhaseErrorCode::Canceled,
            Self::Store(_) | Self::Io(_) => PhaseErrorCode::Unknown,
        }
    }
}

/// A new upload to drive through the pipeline
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub lecture_id: Uuid,
    pub title: String,
    pub captured_at: DateTime<Utc>,
    pub source: PathBuf,
    pub trigger: UploadTrigger,
    /// Capture duration, when known (recorder output)
    pub duration_estimate: Option<Duration>,
}

impl UploadRequest {
    fn duration_minutes(&self) -> Option<u32> {
        self.duration_estimate
            .map(|d| ((d.as_secs_f64() / 60.0).round() as u32).max(1))
    }
}

#[derive(Default)]
struct OrchestratorState {
    /// One entry per lecture id while an upload is outstanding or retriable
    pending: HashMap<Uuid, PendingUpload>,

    /// Lecture ids with an active pipeline instance
    active: HashSet<Uuid>,

    /// Optimistic local lectures, overwritten once the remote snapshot
    /// carries the same id
    local: HashMap<Uuid, Lecture>,
}

/// Drives a local audio file to a confirmed remote blob plus metadata
/// document, with bounded retries and crash recovery.
pub struct UploadOrchestrator {
    user_id: String,
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    store: Arc<PendingStore>,
    ledger: Arc<PipelineTelemetryLedger>,
    policy: Policy,
    retry: RetryPolicy,
    scratch_dir: PathBuf,
    state: Mutex<OrchestratorState>,
}

impl UploadOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        store: Arc<PendingStore>,
        ledger: Arc<PipelineTelemetryLedger>,
        policy: Policy,
        scratch_dir: PathBuf,
    ) -> Self {
        let retry = RetryPolicy::from_policy(&policy);
        Self {
            user_id: user_id.into(),
            documents,
            blobs,
            store,
            ledger,
            policy,
            retry,
            scratch_dir,
            state: Mutex::new(OrchestratorState::default()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The optimistic local view: pending and failed lectures not yet
    /// confirmed by a remote snapshot, for the reconciler to merge.
    pub async fn local_lectures(&self) -> Vec<Lecture> {
        self.state.lock().await.local.values().cloned().collect()
    }

    /// Pending records currently held in memory
    pub async fn pending_records(&self) -> Vec<PendingUploadRecord> {
        self.state
            .lock()
            .await
            .pending
            .values()
            .map(|p| p.record.clone())
            .collect()
    }

    /// Number of active pipeline instances for a lecture id (0 or 1)
    pub async fn active_instances(&self, lecture_id: Uuid) -> usize {
        usize::from(self.state.lock().await.active.contains(&lecture_id))
    }

    /// Drop local optimistic entries that a remote snapshot now covers.
    /// Entries with a live pipeline or a retriable pending record stay.
    pub async fn prune_local(&self, confirmed: &HashSet<Uuid>) {
        let mut state = self.state.lock().await;
        let active = state.active.clone();
        state
            .local
            .retain(|id, _| !confirmed.contains(id) || active.contains(id));
    }

    /// Start the pipeline for a fresh capture or picked file.
    ///
    /// The lecture is inserted locally with status `Processing` and the
    /// pending record persisted before any network call, so the visible
    /// list updates instantly and a crash is recoverable.
    #[instrument(skip(self, request), fields(lecture_id = %request.lecture_id))]
    pub async fn begin_upload(&self, request: UploadRequest) -> Result<(), UploadError> {
        let record = PendingUploadRecord {
            duration_estimate_minutes: request.duration_minutes(),
            ..PendingUploadRecord::new(
                request.lecture_id,
                self.user_id.clone(),
                request.title.clone(),
                request.captured_at,
                request.source.clone(),
                request.trigger,
            )
        };

        {
            let mut state = self.state.lock().await;
            if !state.active.insert(request.lecture_id) {
                warn!("Rejecting concurrent upload for active lecture");
                return Err(UploadError::AlreadyInFlight(request.lecture_id));
            }

            let mut lecture = Lecture::new_processing(
                request.lecture_id,
                request.title.clone(),
                request.captured_at,
            );
            lecture.duration_minutes = request.duration_minutes();
            state.local.insert(request.lecture_id, lecture);
            state
                .pending
                .insert(request.lecture_id, PendingUpload::new(record.clone()));
        }

        // Durable before the first network call
        if let Err(e) = self.store.upsert(&record) {
            let mut state = self.state.lock().await;
            state.active.remove(&request.lecture_id);
            state.pending.remove(&request.lecture_id);
            state.local.remove(&request.lecture_id);
            return Err(e.into());
        }

        self.ledger.upload_attempt(request.lecture_id, false).await;
        info!(title = %request.title, "Upload started");

        self.run_pipeline(request.lecture_id).await
    }

    /// Re-trigger the pipeline for a lecture with a recoverable pending
    /// entry. The retry budget resets for this invocation.
    #[instrument(skip(self))]
    pub async fn retry_upload(&self, lecture_id: Uuid) -> Result<(), UploadError> {
        {
            let mut state = self.state.lock().await;
            if state.active.contains(&lecture_id) {
                warn!("Rejecting concurrent retry for active lecture");
                return Err(UploadError::AlreadyInFlight(lecture_id));
            }

            let pending = match state.pending.get(&lecture_id) {
                Some(pending) => pending.clone(),
                None => {
                    // Not in memory: fall back to the durable store
                    let record = self
                        .store
                        .load(&self.user_id)?
                        .into_iter()
                        .find(|r| r.lecture_id == lecture_id)
                        .ok_or(UploadError::NoRecoverableSource(lecture_id))?;
                    let pending = PendingUpload::new(record);
                    state.pending.insert(lecture_id, pending.clone());
                    pending
                }
            };

            if !pending.record.blob_uploaded && pending.recoverable_source().is_none() {
                return Err(UploadError::NoRecoverableSource(lecture_id));
            }

            state.active.insert(lecture_id);

            // Back to processing while the retry runs
            let mut lecture = Lecture::new_processing(
                lecture_id,
                pending.record.title.clone(),
                pending.record.captured_at,
            );
            lecture.duration_minutes = pending.record.duration_estimate_minutes;
            state.local.insert(lecture_id, lecture);
        }

        self.ledger.upload_attempt(lecture_id, false).await;
        info!("Manual retry started");

        self.run_pipeline(lecture_id).await
    }

    /// Reload pending records after a restart, purge the unrecoverable
    /// ones, and re-enter the pipeline for the rest. Returns the ids
    /// that were resumed.
    #[instrument(skip(self))]
    pub async fn restore_pending_recordings(
        self: &Arc<Self>,
    ) -> Result<Vec<Uuid>, UploadError> {
        let records = self.store.load(&self.user_id)?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let (recoverable, dropped): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| r.local_path.exists() || r.blob_uploaded);

        for record in &dropped {
            warn!(
                lecture_id = %record.lecture_id,
                path = %record.local_path.display(),
                "Dropping pending record with missing local file"
            );
        }
        self.store.replace(&recoverable, &self.user_id)?;

        let mut resumed = Vec::new();
        let mut handles = Vec::new();

        for record in recoverable {
            let lecture_id = record.lecture_id;
            {
                let mut state = self.state.lock().await;
                if !state.active.insert(lecture_id) {
                    continue;
                }
                let mut lecture = Lecture::new_processing(
                    lecture_id,
                    record.title.clone(),
                    record.captured_at,
                );
                lecture.duration_minutes = record.duration_estimate_minutes;
                state.local.insert(lecture_id, lecture);
                state
                    .pending
                    .insert(lecture_id, PendingUpload::new(record));
            }

            // A resume, not a fresh attempt; the distinction matters for
            // analytics, not for the retry budget
            self.ledger.upload_attempt(lecture_id, true).await;
            resumed.push(lecture_id);

            let orchestrator = self.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = orchestrator.run_pipeline(lecture_id).await {
                    error!(%lecture_id, error = %e, "Resumed upload failed");
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        info!(count = resumed.len(), "Restored pending recordings");
        Ok(resumed)
    }

    /// Drop the pending entry and local state for a lecture the user
    /// explicitly discarded. Rejected while an upload is active.
    pub async fn discard(&self, lecture_id: Uuid) -> Result<(), UploadError> {
        {
            let mut state = self.state.lock().await;
            if state.active.contains(&lecture_id) {
                return Err(UploadError::AlreadyInFlight(lecture_id));
            }
            state.pending.remove(&lecture_id);
            state.local.remove(&lecture_id);
        }
        self.store.remove(lecture_id, &self.user_id)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pipeline stages
    // ------------------------------------------------------------------

    /// Run prepare → blob upload → metadata finalize for an id already
    /// holding the active guard. The guard is released on exit.
    async fn run_pipeline(&self, lecture_id: Uuid) -> Result<(), UploadError> {
        let result = self.run_stages(lecture_id).await;

        if let Err(ref e) = result {
            self.fail_upload(lecture_id, e).await;
        }

        self.state.lock().await.active.remove(&lecture_id);
        result
    }

    async fn run_stages(&self, lecture_id: Uuid) -> Result<(), UploadError> {
        let pending = self
            .state
            .lock()
            .await
            .pending
            .get(&lecture_id)
            .cloned()
            .ok_or(UploadError::NoRecoverableSource(lecture_id))?;
        let record = pending.record.clone();

        if !record.blob_uploaded {
            // Stage 1: validate and transcode before touching the network.
            // Failures here are terminal and consume no retry slot.
            let source = pending
                .recoverable_source()
                .ok_or(UploadError::NoRecoverableSource(lecture_id))?;
            let prepared =
                prepare::prepare(&source, lecture_id, &self.scratch_dir, &self.policy).await?;

            if prepared.transcoded {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.pending.get_mut(&lecture_id) {
                    entry.prepared_file = Some(prepared.path.clone());
                }
            }

            let bytes = tokio::fs::read(&prepared.path).await?;
            let hash = prepare::content_hash(&bytes);
            info!(content_hash = %hash, bytes = bytes.len(), "Prepared for upload");
            self.ledger
                .upload_sent(lecture_id, bytes.len() as u64)
                .await;

            // Stage 2: blob write, the only stage consuming the budget
            self.upload_blob(lecture_id, &record, bytes, hash).await?;
        } else {
            // Blob already acknowledged by an earlier attempt; only the
            // metadata document is missing
            info!("Blob already uploaded, skipping to finalize");
            let size = std::fs::metadata(&record.local_path).map(|m| m.len()).unwrap_or(0);
            self.ledger.upload_sent(lecture_id, size).await;
        }

        // Stage 3: metadata finalize (merge semantics, idempotent).
        // A failure here must not trigger a blob re-upload.
        let patch = LecturePatch::finalize(
            record.title.clone(),
            record.captured_at,
            record.duration_estimate_minutes,
            record.remote_audio_path.clone(),
        );
        self.documents
            .put_lecture(&self.user_id, lecture_id, &patch)
            .await?;

        self.finish_upload(lecture_id).await?;
        Ok(())
    }

    async fn upload_blob(
        &self,
        lecture_id: Uuid,
        record: &PendingUploadRecord,
        bytes: Vec<u8>,
        content_hash: String,
    ) -> Result<(), UploadError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self
                .blobs
                .upload(&record.remote_audio_path, bytes.clone(), CANONICAL_CONTENT_TYPE)
                .await
            {
                Ok(()) => {
                    // Persist the acknowledgement so a finalize-only
                    // retry never re-uploads
                    let mut updated = record.clone();
                    updated.blob_uploaded = true;
                    updated.content_hash = Some(content_hash.clone());
                    self.store.upsert(&updated)?;
                    if let Some(entry) = self.state.lock().await.pending.get_mut(&lecture_id) {
                        entry.record.blob_uploaded = true;
                        entry.record.content_hash = Some(content_hash);
                    }
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    if !self.retry.should_retry(attempt) {
                        return Err(UploadError::RetriesExhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }

                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Blob upload failed, retrying"
                    );
                    self.ledger.upload_retried(lecture_id);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(UploadError::Remote(e)),
            }
        }
    }

    /// Durable double-acknowledgement: clear the pending record and close
    /// out the telemetry context.
    async fn finish_upload(&self, lecture_id: Uuid) -> Result<(), UploadError> {
        self.store.remove(lecture_id, &self.user_id)?;
        self.state.lock().await.pending.remove(&lecture_id);
        self.ledger.upload_succeeded(lecture_id).await;
        info!("Upload confirmed");
        Ok(())
    }

    /// Terminal failure: move local and remote status to failed, decide
    /// pending-record retention, emit the failure event.
    async fn fail_upload(&self, lecture_id: Uuid, error: &UploadError) {
        if matches!(error, UploadError::AlreadyInFlight(_)) {
            return;
        }

        let message = error.user_message();
        error!(error = %error, "Upload failed terminally");

        let (recoverable, record) = {
            let mut state = self.state.lock().await;

            if let Some(lecture) = state.local.get_mut(&lecture_id) {
                lecture.status = LectureStatus::Failed;
                lecture.error_message = Some(message.clone());
            }

            match state.pending.get(&lecture_id) {
                Some(pending) => (
                    pending.record.blob_uploaded || pending.recoverable_source().is_some(),
                    Some(pending.record.clone()),
                ),
                None => (false, None),
            }
        };

        // Keep the record only when a later manual retry has something
        // to work from
        if !recoverable {
            if let Err(e) = self.store.remove(lecture_id, &self.user_id) {
                warn!(error = %e, "Failed to drop unrecoverable pending record");
            }
            self.state.lock().await.pending.remove(&lecture_id);
        }

        // Mirror the failure to the remote document, but only for
        // failures that reached the network at all; a rejected file was
        // never the server's business
        let touched_network = matches!(
            error,
            UploadError::RetriesExhausted { .. } | UploadError::Remote(_)
        );
        if touched_network {
            let mut patch = LecturePatch::failed(message.clone());
            if let Some(ref record) = record {
                patch.title = Some(record.title.clone());
                patch.created_at = Some(record.captured_at);
                if record.blob_uploaded {
                    patch.audio_path = Some(record.remote_audio_path.clone());
                }
            }

            if let Err(e) = self
                .documents
                .put_lecture(&self.user_id, lecture_id, &patch)
                .await
            {
                warn!(error = %e, "Could not mirror failure to remote document");
            }
        }

        self.ledger
            .upload_failed(lecture_id, error.telemetry_code(), message)
            .await;
    }
}
