//! Lecture state reconciliation.
//!
//! Produces the single ordered list the rest of the system shows:
//! the remote snapshot is the base (source of truth once confirmed),
//! with still-pending local entries appended so a lecture never
//! disappears between the optimistic insert and the first remote
//! snapshot that contains it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Policy;
use crate::domain::{Lecture, LecturePatch, LectureStatus};
use crate::remote::{BlobStore, DocumentStore};
use crate::telemetry::PipelineTelemetryLedger;
use crate::upload::{probe_duration, UploadOrchestrator};

#[derive(Default)]
struct ReconcilerState {
    /// The current merged, date-descending view
    lectures: Vec<Lecture>,

    /// Lecture ids with an outstanding duration probe
    probing: HashSet<Uuid>,
}

/// Merges the remote snapshot with local pending state and owns the
/// visible status state machine.
pub struct LectureStateReconciler {
    orchestrator: Arc<UploadOrchestrator>,
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    ledger: Arc<PipelineTelemetryLedger>,
    policy: Policy,
    state: Mutex<ReconcilerState>,
}

impl LectureStateReconciler {
    pub fn new(
        orchestrator: Arc<UploadOrchestrator>,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        ledger: Arc<PipelineTelemetryLedger>,
        policy: Policy,
    ) -> Self {
        Self {
            orchestrator,
            documents,
            blobs,
            ledger,
            policy,
            state: Mutex::new(ReconcilerState::default()),
        }
    }

    /// Pure merge: the remote snapshot is the base ordered sequence
    /// (date descending by contract); local-only entries are appended as
    /// synthetic rows, then the whole sequence is re-sorted by date
    /// descending.
    pub fn merge(remote: &[Lecture], local: &[Lecture]) -> Vec<Lecture> {
        let confirmed: HashSet<Uuid> = remote.iter().map(|l| l.id).collect();

        let mut merged: Vec<Lecture> = remote.to_vec();
        merged.extend(
            local
                .iter()
                .filter(|l| !confirmed.contains(&l.id))
                .cloned(),
        );

        merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        merged
    }

    /// The current merged view
    pub async fn lectures(&self) -> Vec<Lecture> {
        self.state.lock().await.lectures.clone()
    }

    /// Process one remote snapshot: feed the ledger (strictly in arrival
    /// order), merge with local pending state, and kick off lazy
    /// duration backfills. Returns the new merged view.
    pub async fn apply_snapshot(self: &Arc<Self>, remote: Vec<Lecture>) -> Vec<Lecture> {
        self.ledger.observe_snapshot(&remote).await;

        let confirmed: HashSet<Uuid> = remote.iter().map(|l| l.id).collect();
        self.orchestrator.prune_local(&confirmed).await;

        let local = self.orchestrator.local_lectures().await;
        let merged = Self::merge(&remote, &local);

        {
            let mut state = self.state.lock().await;
            state.lectures = merged.clone();
        }

        for lecture in &merged {
            if lecture.duration_minutes.is_none() && lecture.audio_path.is_some() {
                self.spawn_duration_backfill(lecture.clone()).await;
            }
        }

        merged
    }

    /// Consume the live feed until the sender side closes. Snapshots are
    /// handled one at a time, never re-ordered or batched.
    pub async fn run(self: Arc<Self>, mut feed: mpsc::UnboundedReceiver<Vec<Lecture>>) {
        info!("Reconciler feed started");
        while let Some(snapshot) = feed.recv().await {
            self.apply_snapshot(snapshot).await;
        }
        info!("Reconciler feed closed");
    }

    /// Whether the UI should offer a summary retry for this lecture.
    ///
    /// Pure function of the lecture and the current time: failed with a
    /// transcript, or summarizing past its in-progress marker's expiry
    /// (falling back to a fixed TTL from `started_at` when the marker
    /// has no explicit expiry).
    pub fn should_show_summary_retry(&self, lecture: &Lecture, now: DateTime<Utc>) -> bool {
        should_show_summary_retry(lecture, now, self.policy.summary_ttl)
    }

    /// Re-request summarization for a stuck or failed lecture
    pub async fn retry_summary(&self, lecture_id: Uuid) -> anyhow::Result<()> {
        self.ledger.summarization_requested(lecture_id).await;

        let patch = LecturePatch {
            status: Some(LectureStatus::Summarizing),
            ..Default::default()
        };
        self.documents
            .put_lecture(self.orchestrator.user_id(), lecture_id, &patch)
            .await?;

        Ok(())
    }

    /// At most one outstanding probe per lecture id
    async fn spawn_duration_backfill(self: &Arc<Self>, lecture: Lecture) {
        {
            let mut state = self.state.lock().await;
            if !state.probing.insert(lecture.id) {
                return;
            }
        }

        let reconciler = self.clone();
        tokio::spawn(async move {
            reconciler.backfill_duration(lecture).await;
        });
    }

    async fn backfill_duration(self: &Arc<Self>, lecture: Lecture) {
        let result = self.probe_and_write_back(&lecture).await;

        if let Err(e) = result {
            warn!(lecture_id = %lecture.id, error = %e, "Duration backfill failed");
        }

        self.state.lock().await.probing.remove(&lecture.id);
    }

    async fn probe_and_write_back(&self, lecture: &Lecture) -> anyhow::Result<()> {
        let path = lecture
            .audio_path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no audio path"))?;

        let url = self.blobs.download_url(path).await?;
        let duration = probe_duration(&url).await?;
        let minutes = ((duration.as_secs_f64() / 60.0).round() as u32).max(1);

        debug!(lecture_id = %lecture.id, minutes, "Probed media duration");

        let patch = LecturePatch {
            duration_minutes: Some(minutes),
            ..Default::default()
        };
        self.documents
            .put_lecture(self.orchestrator.user_id(), lecture.id, &patch)
            .await?;

        Ok(())
    }
}

/// Stuck-summary retry eligibility; see [`LectureStateReconciler::should_show_summary_retry`].
pub fn should_show_summary_retry(
    lecture: &Lecture,
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> bool {
    match lecture.status {
        LectureStatus::Failed => lecture.has_transcript(),
        LectureStatus::Summarizing => match lecture.summary_in_progress {
            Some(progress) => match progress.expires_at {
                Some(expires_at) => now > expires_at,
                None => progress
                    .started_at
                    .map(|started_at| now - started_at > ttl)
                    .unwrap_or(false),
            },
            None => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SummaryProgress;

    fn lecture(status: LectureStatus, created_at: DateTime<Utc>) -> Lecture {
        let mut lecture = Lecture::new_processing(Uuid::new_v4(), "Talk".to_string(), created_at);
        lecture.status = status;
        lecture
    }

    #[test]
    fn test_merge_appends_pending_only_entries() {
        let base = Utc::now();
        let remote = vec![
            lecture(LectureStatus::Ready, base),
            lecture(LectureStatus::Processing, base - chrono::Duration::hours(2)),
        ];
        let pending_only = lecture(
            LectureStatus::Processing,
            base - chrono::Duration::hours(1),
        );

        let merged = LectureStateReconciler::merge(&remote, &[pending_only.clone()]);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].id, remote[0].id);
        assert_eq!(merged[1].id, pending_only.id);
        assert_eq!(merged[2].id, remote[1].id);
    }

    #[test]
    fn test_merge_prefers_remote_for_same_id() {
        let base = Utc::now();
        let mut remote_version = lecture(LectureStatus::Ready, base);
        remote_version.transcript = Some("text".to_string());

        let mut local_version = remote_version.clone();
        local_version.status = LectureStatus::Processing;
        local_version.transcript = None;

        let merged = LectureStateReconciler::merge(&[remote_version.clone()], &[local_version]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, LectureStatus::Ready);
        assert!(merged[0].has_transcript());
    }

    #[test]
    fn test_failed_with_transcript_is_retry_eligible() {
        let ttl = chrono::Duration::minutes(15);
        let now = Utc::now();

        let mut failed = lecture(LectureStatus::Failed, now);
        assert!(!should_show_summary_retry(&failed, now, ttl));

        failed.transcript = Some("text".to_string());
        assert!(should_show_summary_retry(&failed, now, ttl));
    }

    #[test]
    fn test_summarizing_ttl_fallback() {
        let ttl = chrono::Duration::minutes(15);
        let now = Utc::now();

        let mut stuck = lecture(LectureStatus::Summarizing, now);

        // Started 20 minutes ago, no explicit expiry: eligible
        stuck.summary_in_progress = Some(SummaryProgress {
            started_at: Some(now - chrono::Duration::minutes(20)),
            expires_at: None,
        });
        assert!(should_show_summary_retry(&stuck, now, ttl));

        // Started 5 minutes ago: not eligible yet
        stuck.summary_in_progress = Some(SummaryProgress {
            started_at: Some(now - chrono::Duration::minutes(5)),
            expires_at: None,
        });
        assert!(!should_show_summary_retry(&stuck, now, ttl));
    }

    #[test]
    fn test_summarizing_explicit_expiry_wins() {
        let ttl = chrono::Duration::minutes(15);
        let now = Utc::now();

        let mut stuck = lecture(LectureStatus::Summarizing, now);

        // Expiry in the future beats an old started_at
        stuck.summary_in_progress = Some(SummaryProgress {
            started_at: Some(now - chrono::Duration::hours(1)),
            expires_at: Some(now + chrono::Duration::minutes(5)),
        });
        assert!(!should_show_summary_retry(&stuck, now, ttl));

        // Past expiry: eligible
        stuck.summary_in_progress = Some(SummaryProgress {
            started_at: Some(now - chrono::Duration::hours(1)),
            expires_at: Some(now - chrono::Duration::minutes(1)),
        });
        assert!(should_show_summary_retry(&stuck, now, ttl));
    }

    #[test]
    fn test_legacy_marker_without_timestamps_not_eligible() {
        let ttl = chrono::Duration::minutes(15);
        let now = Utc::now();

        let mut stuck = lecture(LectureStatus::Summarizing, now);
        stuck.summary_in_progress = Some(SummaryProgress {
            started_at: None,
            expires_at: None,
        });

        assert!(!should_show_summary_retry(&stuck, now, ttl));
    }

    #[test]
    fn test_non_summarizing_statuses_not_eligible() {
        let ttl = chrono::Duration::minutes(15);
        let now = Utc::now();

        for status in [
            LectureStatus::Processing,
            LectureStatus::Transcribed,
            LectureStatus::Ready,
            LectureStatus::BlockedQuota,
        ] {
            let mut candidate = lecture(status, now);
            candidate.transcript = Some("text".to_string());
            candidate.summary_in_progress = Some(SummaryProgress {
                started_at: Some(now - chrono::Duration::hours(1)),
                expires_at: None,
            });
            assert!(
                !should_show_summary_retry(&candidate, now, ttl),
                "{:?} must not be eligible",
                status
            );
        }
    }
}
