//! Pipeline telemetry ledger: one coherent operation out of three
//! independently failing phases.
//!
//! The ledger has no direct knowledge of server-side execution. Upload
//! events come from the orchestrator; transcription and summarization
//! events are derived by diffing consecutive remote snapshots, so missed
//! intermediate states (a snapshot jumping straight to `ready`) still
//! produce exactly one success per phase.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{Lecture, LectureStatus};

use super::context::{
    CorrelationIds, Phase, PhaseErrorCode, SummarizationContext, TranscriptionContext,
    UploadContext,
};
use super::journal::TelemetryJournal;

/// Lifecycle position within a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEventKind {
    /// The phase is first contemplated
    Attempt,

    /// The phase's request has left the client
    Sent,

    /// The phase's output first appeared (exactly once)
    Success,

    /// The phase's terminal failure was observed (exactly once)
    Failure,
}

/// One emitted lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub lecture_id: Uuid,
    pub phase: Phase,
    pub kind: PhaseEventKind,
    pub correlation: CorrelationIds,

    /// Blob-upload retries that preceded a success
    pub retries_count: Option<u32>,

    /// Uploaded bytes (upload phase)
    pub bytes: Option<u64>,

    /// Transcript characters (transcription phase)
    pub chars: Option<u64>,

    /// Whether the upload was a crash-recovery resume
    pub resumed: bool,

    pub error_code: Option<PhaseErrorCode>,
    pub error_message: Option<String>,
}

impl PhaseEvent {
    fn new(lecture_id: Uuid, phase: Phase, kind: PhaseEventKind, correlation: CorrelationIds) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            lecture_id,
            phase,
            kind,
            correlation,
            retries_count: None,
            bytes: None,
            chars: None,
            resumed: false,
            error_code: None,
            error_message: None,
        }
    }
}

/// Identifiers of phases already concluded, carried into successors
#[derive(Debug, Clone, Copy, Default)]
struct CompletedPhases {
    upload_id: Option<Uuid>,
    transcription_id: Option<Uuid>,
}

#[derive(Default)]
struct LedgerState {
    uploads: HashMap<Uuid, UploadContext>,
    transcriptions: HashMap<Uuid, TranscriptionContext>,
    summarizations: HashMap<Uuid, SummarizationContext>,
    completed: HashMap<Uuid, CompletedPhases>,
    /// Last known lecture per id, for snapshot diffing
    previous: HashMap<Uuid, Lecture>,
    events: Vec<PhaseEvent>,
}

impl LedgerState {
    fn is_tracked(&self, lecture_id: Uuid) -> bool {
        self.completed.contains_key(&lecture_id)
            || self.uploads.contains_key(&lecture_id)
            || self.transcriptions.contains_key(&lecture_id)
            || self.summarizations.contains_key(&lecture_id)
    }
}

/// Correlates identifiers across phases and emits lifecycle events
pub struct PipelineTelemetryLedger {
    journal: Option<TelemetryJournal>,
    state: Mutex<LedgerState>,
}

impl PipelineTelemetryLedger {
    pub fn new(journal: Option<TelemetryJournal>) -> Self {
        Self {
            journal,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// All events emitted so far, in order
    pub fn events(&self) -> Vec<PhaseEvent> {
        self.state.lock().unwrap().events.clone()
    }

    async fn flush(&self, emitted: Vec<PhaseEvent>) {
        if let Some(ref journal) = self.journal {
            for event in &emitted {
                if let Err(e) = journal.append(event).await {
                    debug!(error = %e, "Failed to journal telemetry event");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Upload phase: driven directly by the orchestrator
    // ------------------------------------------------------------------

    /// A new upload lifecycle is contemplated. A fresh attempt gets a
    /// fresh identifier; an already-open context is left untouched.
    pub async fn upload_attempt(&self, lecture_id: Uuid, resumed: bool) {
        let emitted = {
            let mut state = self.state.lock().unwrap();
            if state.uploads.contains_key(&lecture_id) {
                Vec::new()
            } else {
                let context = UploadContext::new(lecture_id, resumed);
                let mut event = PhaseEvent::new(
                    lecture_id,
                    Phase::Upload,
                    PhaseEventKind::Attempt,
                    CorrelationIds {
                        upload_id: Some(context.id),
                        ..Default::default()
                    },
                );
                event.resumed = resumed;
                state.uploads.insert(lecture_id, context);
                state.events.push(event.clone());
                vec![event]
            }
        };
        self.flush(emitted).await;
    }

    /// The blob write is leaving the client. Idempotent: sending twice
    /// must not double-emit.
    pub async fn upload_sent(&self, lecture_id: Uuid, bytes: u64) {
        let emitted = {
            let mut state = self.state.lock().unwrap();
            match state.uploads.get_mut(&lecture_id) {
                Some(context) if !context.sent => {
                    context.sent = true;
                    context.bytes = Some(bytes);
                    let resumed = context.resumed;
                    let correlation = CorrelationIds {
                        upload_id: Some(context.id),
                        ..Default::default()
                    };
                    let mut event = PhaseEvent::new(
                        lecture_id,
                        Phase::Upload,
                        PhaseEventKind::Sent,
                        correlation,
                    );
                    event.bytes = Some(bytes);
                    event.resumed = resumed;
                    state.events.push(event.clone());
                    vec![event]
                }
                _ => Vec::new(),
            }
        };
        self.flush(emitted).await;
    }

    /// A transient blob-write failure consumed a retry slot
    pub fn upload_retried(&self, lecture_id: Uuid) {
        let mut state = self.state.lock().unwrap();
        if let Some(context) = state.uploads.get_mut(&lecture_id) {
            context.retries += 1;
        }
    }

    /// The upload concluded: blob and metadata both acknowledged.
    /// Discards the upload context and opens the transcription context,
    /// since the server picks the recording up from here.
    pub async fn upload_succeeded(&self, lecture_id: Uuid) {
        let emitted = {
            let mut state = self.state.lock().unwrap();
            let Some(context) = state.uploads.remove(&lecture_id) else {
                return;
            };

            let mut emitted = Vec::new();

            let mut success = PhaseEvent::new(
                lecture_id,
                Phase::Upload,
                PhaseEventKind::Success,
                CorrelationIds {
                    upload_id: Some(context.id),
                    ..Default::default()
                },
            );
            success.retries_count = Some(context.retries);
            success.bytes = context.bytes;
            success.resumed = context.resumed;
            state.events.push(success.clone());
            emitted.push(success);

            state.completed.entry(lecture_id).or_default().upload_id = Some(context.id);

            // Transcription begins server-side as soon as the upload
            // lands; open its context now so its events carry the
            // upload identifier.
            emitted.extend(Self::open_transcription(&mut state, lecture_id, true));
            emitted
        };
        self.flush(emitted).await;
    }

    /// The upload failed terminally. Emits exactly one failure and
    /// discards the context; a later retry opens a fresh one.
    pub async fn upload_failed(
        &self,
        lecture_id: Uuid,
        code: PhaseErrorCode,
        message: impl Into<String>,
    ) {
        let emitted = {
            let mut state = self.state.lock().unwrap();
            let Some(context) = state.uploads.remove(&lecture_id) else {
                return;
            };

            let mut event = PhaseEvent::new(
                lecture_id,
                Phase::Upload,
                PhaseEventKind::Failure,
                CorrelationIds {
                    upload_id: Some(context.id),
                    ..Default::default()
                },
            );
            event.retries_count = Some(context.retries);
            event.resumed = context.resumed;
            event.error_code = Some(code);
            event.error_message = Some(message.into());
            state.events.push(event.clone());
            vec![event]
        };
        self.flush(emitted).await;
    }

    /// The client explicitly requested (or re-requested) summarization
    pub async fn summarization_requested(&self, lecture_id: Uuid) {
        let emitted = {
            let mut state = self.state.lock().unwrap();
            Self::open_summarization(&mut state, lecture_id)
        };
        self.flush(emitted).await;
    }

    // ------------------------------------------------------------------
    // Transcription & summarization: snapshot-diff driven
    // ------------------------------------------------------------------

    /// Process one remote snapshot, strictly in arrival order.
    pub async fn observe_snapshot(&self, lectures: &[Lecture]) {
        let emitted = {
            let mut state = self.state.lock().unwrap();
            let mut emitted = Vec::new();

            for lecture in lectures {
                let previous = state.previous.get(&lecture.id).cloned();

                // First sight of a lecture this client never acted on:
                // adopt it as baseline without emitting anything.
                if previous.is_none() && !state.is_tracked(lecture.id) {
                    state.previous.insert(lecture.id, lecture.clone());
                    continue;
                }

                let baseline = previous
                    .unwrap_or_else(|| Lecture::new_processing(lecture.id, lecture.title.clone(), lecture.created_at));

                emitted.extend(Self::diff_lecture(&mut state, &baseline, lecture));
                state.previous.insert(lecture.id, lecture.clone());
            }

            emitted
        };
        self.flush(emitted).await;
    }

    /// Diff one lecture against its last known form
    fn diff_lecture(state: &mut LedgerState, prev: &Lecture, next: &Lecture) -> Vec<PhaseEvent> {
        let mut emitted = Vec::new();
        let lecture_id = next.id;

        // Transcription success: transcript absent before, present now
        if !prev.has_transcript() && next.has_transcript() {
            emitted.extend(Self::open_transcription(state, lecture_id, false));
            if let Some(context) = state.transcriptions.remove(&lecture_id) {
                let mut event = PhaseEvent::new(
                    lecture_id,
                    Phase::Transcription,
                    PhaseEventKind::Success,
                    context.correlation(),
                );
                event.chars = next.transcript.as_ref().map(|t| t.len() as u64);
                state.events.push(event.clone());
                emitted.push(event);

                let completed = state.completed.entry(lecture_id).or_default();
                completed.transcription_id = Some(context.id);
            }
        }

        // Summarization contemplated: in-flight marker or status
        let summarizing = next.status == LectureStatus::Summarizing
            || next.summary_in_progress.is_some();
        if summarizing && !next.has_summary() {
            emitted.extend(Self::open_summarization(state, lecture_id));
        }

        // Summarization success: summary absent before, present now
        if !prev.has_summary() && next.has_summary() {
            emitted.extend(Self::open_summarization(state, lecture_id));
            if let Some(context) = state.summarizations.remove(&lecture_id) {
                let event = PhaseEvent::new(
                    lecture_id,
                    Phase::Summarization,
                    PhaseEventKind::Success,
                    context.correlation(),
                );
                state.events.push(event.clone());
                emitted.push(event);
            }
        }

        // Terminal failure while a context is still open closes the
        // innermost open phase
        let failed_now = matches!(
            next.status,
            LectureStatus::Failed | LectureStatus::BlockedQuota
        );
        let failed_before = matches!(
            prev.status,
            LectureStatus::Failed | LectureStatus::BlockedQuota
        );
        if failed_now && !failed_before {
            let (code, message) = if next.status == LectureStatus::BlockedQuota {
                (
                    PhaseErrorCode::Quota,
                    next.quota_block_reason
                        .clone()
                        .unwrap_or_else(|| "quota_blocked".to_string()),
                )
            } else {
                (
                    PhaseErrorCode::Unknown,
                    next.error_message
                        .clone()
                        .unwrap_or_else(|| "processing failed".to_string()),
                )
            };

            if let Some(context) = state.summarizations.remove(&lecture_id) {
                let mut event = PhaseEvent::new(
                    lecture_id,
                    Phase::Summarization,
                    PhaseEventKind::Failure,
                    context.correlation(),
                );
                event.error_code = Some(code);
                event.error_message = Some(message);
                state.events.push(event.clone());
                emitted.push(event);
            } else if let Some(context) = state.transcriptions.remove(&lecture_id) {
                let mut event = PhaseEvent::new(
                    lecture_id,
                    Phase::Transcription,
                    PhaseEventKind::Failure,
                    context.correlation(),
                );
                event.error_code = Some(code);
                event.error_message = Some(message);
                state.events.push(event.clone());
                emitted.push(event);
            }
        }

        emitted
    }

    /// Open the transcription context if absent, emitting attempt and
    /// sent. `explicit` marks the normal post-upload opening; implicit
    /// openings happen when a snapshot skips intermediate states.
    fn open_transcription(
        state: &mut LedgerState,
        lecture_id: Uuid,
        explicit: bool,
    ) -> Vec<PhaseEvent> {
        if state.transcriptions.contains_key(&lecture_id) {
            return Vec::new();
        }

        let upload_id = state
            .completed
            .get(&lecture_id)
            .and_then(|c| c.upload_id);
        let mut context = TranscriptionContext::new(lecture_id, upload_id);
        let correlation = context.correlation();

        if !explicit {
            debug!(%lecture_id, "Opening transcription context from snapshot diff");
        }

        let attempt = PhaseEvent::new(
            lecture_id,
            Phase::Transcription,
            PhaseEventKind::Attempt,
            correlation,
        );
        // The audio is with the server the moment the upload lands
        context.sent = true;
        let sent = PhaseEvent::new(
            lecture_id,
            Phase::Transcription,
            PhaseEventKind::Sent,
            correlation,
        );

        state.transcriptions.insert(lecture_id, context);
        state.events.push(attempt.clone());
        state.events.push(sent.clone());
        vec![attempt, sent]
    }

    /// Open the summarization context if absent, carrying forward the
    /// identifiers of the phases that produced its input.
    fn open_summarization(state: &mut LedgerState, lecture_id: Uuid) -> Vec<PhaseEvent> {
        if state.summarizations.contains_key(&lecture_id) {
            return Vec::new();
        }

        let completed = state.completed.get(&lecture_id).copied().unwrap_or_default();
        let mut context =
            SummarizationContext::new(lecture_id, completed.upload_id, completed.transcription_id);
        let correlation = context.correlation();

        let attempt = PhaseEvent::new(
            lecture_id,
            Phase::Summarization,
            PhaseEventKind::Attempt,
            correlation,
        );
        context.sent = true;
        let sent = PhaseEvent::new(
            lecture_id,
            Phase::Summarization,
            PhaseEventKind::Sent,
            correlation,
        );

        state.summarizations.insert(lecture_id, context);
        state.events.push(attempt.clone());
        state.events.push(sent.clone());
        vec![attempt, sent]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LectureSummary;

    fn ledger() -> PipelineTelemetryLedger {
        PipelineTelemetryLedger::new(None)
    }

    fn lecture(id: Uuid, status: LectureStatus) -> Lecture {
        let mut lecture = Lecture::new_processing(id, "Talk".to_string(), Utc::now());
        lecture.status = status;
        lecture
    }

    fn count(events: &[PhaseEvent], phase: Phase, kind: PhaseEventKind) -> usize {
        events
            .iter()
            .filter(|e| e.phase == phase && e.kind == kind)
            .count()
    }

    #[tokio::test]
    async fn test_upload_sent_is_idempotent() {
        let ledger = ledger();
        let id = Uuid::new_v4();

        ledger.upload_attempt(id, false).await;
        ledger.upload_sent(id, 1024).await;
        ledger.upload_sent(id, 1024).await;

        let events = ledger.events();
        assert_eq!(count(&events, Phase::Upload, PhaseEventKind::Sent), 1);
    }

    #[tokio::test]
    async fn test_upload_success_carries_retry_count() {
        let ledger = ledger();
        let id = Uuid::new_v4();

        ledger.upload_attempt(id, false).await;
        ledger.upload_sent(id, 1024).await;
        ledger.upload_retried(id);
        ledger.upload_retried(id);
        ledger.upload_succeeded(id).await;

        let events = ledger.events();
        let success: Vec<_> = events
            .iter()
            .filter(|e| e.phase == Phase::Upload && e.kind == PhaseEventKind::Success)
            .collect();
        assert_eq!(success.len(), 1);
        assert_eq!(success[0].retries_count, Some(2));
        assert_eq!(count(&events, Phase::Upload, PhaseEventKind::Failure), 0);
    }

    #[tokio::test]
    async fn test_upload_failure_is_exactly_once() {
        let ledger = ledger();
        let id = Uuid::new_v4();

        ledger.upload_attempt(id, false).await;
        ledger
            .upload_failed(id, PhaseErrorCode::Network, "connection reset")
            .await;
        // Context discarded; a second report has nothing to close
        ledger
            .upload_failed(id, PhaseErrorCode::Network, "connection reset")
            .await;

        let events = ledger.events();
        assert_eq!(count(&events, Phase::Upload, PhaseEventKind::Failure), 1);
    }

    #[tokio::test]
    async fn test_snapshot_jump_to_ready_emits_one_success_per_phase() {
        let ledger = ledger();
        let id = Uuid::new_v4();

        ledger.upload_attempt(id, false).await;
        ledger.upload_sent(id, 2048).await;
        ledger.upload_succeeded(id).await;

        // Snapshot 1: still processing
        ledger
            .observe_snapshot(&[lecture(id, LectureStatus::Processing)])
            .await;

        // Snapshot 2 jumps straight to ready with transcript and summary
        let mut ready = lecture(id, LectureStatus::Ready);
        ready.transcript = Some("In the name of patience...".to_string());
        ready.summary = Some(LectureSummary {
            main_theme: "Patience".to_string(),
            key_points: vec![],
            references: vec![],
            weekly_actions: vec![],
        });
        ledger.observe_snapshot(&[ready.clone()]).await;

        // A repeat of the same snapshot changes nothing
        ledger.observe_snapshot(&[ready]).await;

        let events = ledger.events();
        assert_eq!(count(&events, Phase::Transcription, PhaseEventKind::Success), 1);
        assert_eq!(count(&events, Phase::Summarization, PhaseEventKind::Success), 1);
        assert_eq!(count(&events, Phase::Transcription, PhaseEventKind::Failure), 0);
        assert_eq!(count(&events, Phase::Summarization, PhaseEventKind::Failure), 0);
    }

    #[tokio::test]
    async fn test_summarization_carries_forward_predecessor_ids() {
        let ledger = ledger();
        let id = Uuid::new_v4();

        ledger.upload_attempt(id, false).await;
        ledger.upload_succeeded(id).await;

        let mut transcribed = lecture(id, LectureStatus::Transcribed);
        transcribed.transcript = Some("text".to_string());
        ledger.observe_snapshot(&[transcribed.clone()]).await;

        let mut summarizing = transcribed.clone();
        summarizing.status = LectureStatus::Summarizing;
        ledger.observe_snapshot(&[summarizing]).await;

        let events = ledger.events();
        let attempt = events
            .iter()
            .find(|e| e.phase == Phase::Summarization && e.kind == PhaseEventKind::Attempt)
            .unwrap();

        assert!(attempt.correlation.upload_id.is_some());
        assert!(attempt.correlation.transcription_id.is_some());
        assert!(attempt.correlation.summarization_id.is_some());
    }

    #[tokio::test]
    async fn test_failure_closes_open_phase() {
        let ledger = ledger();
        let id = Uuid::new_v4();

        ledger.upload_attempt(id, false).await;
        ledger.upload_succeeded(id).await;

        // Transcription context is open; server reports failure
        let mut failed = lecture(id, LectureStatus::Failed);
        failed.error_message = Some("decode error".to_string());
        ledger.observe_snapshot(&[failed.clone()]).await;

        // A repeat snapshot must not double-emit
        ledger.observe_snapshot(&[failed]).await;

        let events = ledger.events();
        assert_eq!(count(&events, Phase::Transcription, PhaseEventKind::Failure), 1);
        assert_eq!(count(&events, Phase::Transcription, PhaseEventKind::Success), 0);
    }

    #[tokio::test]
    async fn test_quota_block_maps_to_quota_code() {
        let ledger = ledger();
        let id = Uuid::new_v4();

        ledger.upload_attempt(id, false).await;
        ledger.upload_succeeded(id).await;

        let mut blocked = lecture(id, LectureStatus::BlockedQuota);
        blocked.quota_block_reason = Some("monthly_cap".to_string());
        ledger.observe_snapshot(&[blocked]).await;

        let events = ledger.events();
        let failure = events
            .iter()
            .find(|e| e.kind == PhaseEventKind::Failure)
            .unwrap();
        assert_eq!(failure.error_code, Some(PhaseErrorCode::Quota));
        assert_eq!(failure.error_message.as_deref(), Some("monthly_cap"));
    }

    #[tokio::test]
    async fn test_untracked_lectures_adopt_baseline_silently() {
        let ledger = ledger();
        let id = Uuid::new_v4();

        // Initial sync of a lecture finished long ago on another device
        let mut ready = lecture(id, LectureStatus::Ready);
        ready.transcript = Some("old".to_string());
        ready.summary = Some(LectureSummary {
            main_theme: "History".to_string(),
            key_points: vec![],
            references: vec![],
            weekly_actions: vec![],
        });
        ledger.observe_snapshot(&[ready]).await;

        assert!(ledger.events().is_empty());
    }
}
