//! Lecture: the user-visible unit of work.
//!
//! A lecture tracks one recorded talk through capture, upload,
//! transcription and summarization. Remote documents are loosely typed;
//! decoding is strict at the store boundary: malformed documents are
//! dropped, unknown status strings map to `Processing`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Visible status of a lecture.
///
/// `recording → processing → transcribed → summarizing → ready`, with
/// `failed` and `blocked_quota` as terminal-for-this-attempt states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LectureStatus {
    /// Capturing audio; not yet a remote document
    Recording,

    /// Uploading or awaiting transcription
    Processing,

    /// Transcript available, summary not yet requested/started
    Transcribed,

    /// Summary generation in flight
    Summarizing,

    /// Summary present
    Ready,

    /// Terminal for this attempt; may carry a transcript
    Failed,

    /// Rejected by server-side quota enforcement
    BlockedQuota,
}

impl LectureStatus {
    /// Parse a remote status string. Unknown strings map to `Processing`
    /// rather than failing the merge.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "recording" => Self::Recording,
            "processing" => Self::Processing,
            "transcribed" => Self::Transcribed,
            "summarizing" => Self::Summarizing,
            "ready" => Self::Ready,
            "failed" => Self::Failed,
            "blocked_quota" => Self::BlockedQuota,
            other => {
                debug!(status = other, "Unknown lecture status, defaulting to processing");
                Self::Processing
            }
        }
    }

    /// Wire representation used in remote documents
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::Processing => "processing",
            Self::Transcribed => "transcribed",
            Self::Summarizing => "summarizing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::BlockedQuota => "blocked_quota",
        }
    }
}

/// Structured summary produced by the summarization pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LectureSummary {
    pub main_theme: String,

    #[serde(default)]
    pub key_points: Vec<String>,

    /// Explicit references cited in the talk
    #[serde(default)]
    pub references: Vec<String>,

    #[serde(default)]
    pub weekly_actions: Vec<String>,
}

/// Marker that a summarization job is in flight.
///
/// Modern documents carry started_at/expires_at; legacy documents carry a
/// bare boolean with no timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryProgress {
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SummaryProgress {
    /// Decode from either the modern object form or the legacy boolean.
    /// Legacy `true` yields a marker with no timestamps; `false` is absent.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(true) => Some(Self {
                started_at: None,
                expires_at: None,
            }),
            serde_json::Value::Bool(false) | serde_json::Value::Null => None,
            other => serde_json::from_value(other.clone()).ok(),
        }
    }
}

/// Requested / in-progress / errored translation language codes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationSet {
    #[serde(default)]
    pub requested: BTreeSet<String>,

    #[serde(default)]
    pub in_progress: BTreeSet<String>,

    #[serde(default)]
    pub errored: BTreeSet<String>,
}

impl TranslationSet {
    pub fn is_empty(&self) -> bool {
        self.requested.is_empty() && self.in_progress.is_empty() && self.errored.is_empty()
    }
}

/// The user-visible unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lecture {
    /// Client-generated, stable across retries, immutable once created
    pub id: Uuid,

    pub title: String,

    pub created_at: DateTime<Utc>,

    /// Filled in lazily once the audio has been probed
    pub duration_minutes: Option<u32>,

    /// Server-assigned billed minutes
    pub charged_minutes: Option<u32>,

    #[serde(default)]
    pub favorite: bool,

    pub status: LectureStatus,

    /// Machine-readable reason code when status is `BlockedQuota`
    pub quota_block_reason: Option<String>,

    /// User-facing error message when status is `Failed`
    pub error_message: Option<String>,

    pub transcript: Option<String>,

    pub formatted_transcript: Option<String>,

    pub summary: Option<LectureSummary>,

    pub summary_in_progress: Option<SummaryProgress>,

    #[serde(default)]
    pub translations: TranslationSet,

    /// Remote blob path of the uploaded audio
    pub audio_path: Option<String>,

    pub folder_id: Option<Uuid>,

    pub folder_name: Option<String>,
}

impl Lecture {
    /// A freshly created lecture, optimistically `Processing` before any
    /// network call completes.
    pub fn new_processing(id: Uuid, title: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            title,
            created_at,
            duration_minutes: None,
            charged_minutes: None,
            favorite: false,
            status: LectureStatus::Processing,
            quota_block_reason: None,
            error_message: None,
            transcript: None,
            formatted_transcript: None,
            summary: None,
            summary_in_progress: None,
            translations: TranslationSet::default(),
            audio_path: None,
            folder_id: None,
            folder_name: None,
        }
    }

    pub fn has_transcript(&self) -> bool {
        self.transcript.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn has_summary(&self) -> bool {
        self.summary.is_some()
    }
}

/// Raw remote lecture document, prior to strict decoding.
///
/// Fields the server may omit or type loosely are Options / raw values.
#[derive(Debug, Clone, Deserialize)]
pub struct LectureDocument {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub charged_minutes: Option<u32>,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub quota_block_reason: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub formatted_transcript: Option<String>,
    #[serde(default)]
    pub summary: Option<LectureSummary>,
    /// Modern object form or legacy boolean
    #[serde(default)]
    pub summary_in_progress: Option<serde_json::Value>,
    #[serde(default)]
    pub translations: TranslationSet,
    #[serde(default)]
    pub audio_path: Option<String>,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub folder_name: Option<String>,
}

impl LectureDocument {
    /// Strict decode. Returns None for documents that cannot represent a
    /// lecture (unparseable id); unknown statuses decode to `Processing`.
    pub fn decode(self) -> Option<Lecture> {
        let id = Uuid::parse_str(&self.id).ok()?;

        let status = self
            .status
            .as_deref()
            .map(LectureStatus::parse)
            .unwrap_or(LectureStatus::Processing);

        let transcript = self.transcript.filter(|t| !t.is_empty());

        // A lecture with no transcript can never carry a summary.
        let summary = if transcript.is_some() {
            self.summary
        } else {
            if self.summary.is_some() {
                debug!(%id, "Dropping summary on lecture without transcript");
            }
            None
        };

        Some(Lecture {
            id,
            title: self.title,
            created_at: self.created_at,
            duration_minutes: self.duration_minutes,
            charged_minutes: self.charged_minutes,
            favorite: self.favorite,
            status,
            quota_block_reason: self.quota_block_reason,
            error_message: self.error_message,
            transcript,
            formatted_transcript: self.formatted_transcript,
            summary,
            summary_in_progress: self
                .summary_in_progress
                .as_ref()
                .and_then(SummaryProgress::from_value),
            translations: self.translations,
            audio_path: self.audio_path,
            folder_id: self.folder_id.and_then(|f| Uuid::parse_str(&f).ok()),
            folder_name: self.folder_name,
        })
    }
}

/// Field-level patch for merge-upsert into the remote document store.
///
/// Only present fields are written; absent fields keep their remote value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LecturePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favorite: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LectureStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_name: Option<String>,
}

impl LecturePatch {
    /// The patch written when an upload finalizes: title, date, status,
    /// duration and blob path.
    pub fn finalize(
        title: String,
        created_at: DateTime<Utc>,
        duration_minutes: Option<u32>,
        audio_path: String,
    ) -> Self {
        Self {
            title: Some(title),
            created_at: Some(created_at),
            duration_minutes,
            status: Some(LectureStatus::Processing),
            audio_path: Some(audio_path),
            ..Default::default()
        }
    }

    /// The patch written when an upload fails terminally.
    pub fn failed(message: String) -> Self {
        Self {
            status: Some(LectureStatus::Failed),
            error_message: Some(message),
            ..Default::default()
        }
    }
}

/// Purely organizational grouping; no lifecycle coupling to uploads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, status: Option<&str>) -> LectureDocument {
        LectureDocument {
            id: id.to_string(),
            title: "Test".to_string(),
            created_at: Utc::now(),
            duration_minutes: None,
            charged_minutes: None,
            favorite: false,
            status: status.map(|s| s.to_string()),
            quota_block_reason: None,
            error_message: None,
            transcript: None,
            formatted_transcript: None,
            summary: None,
            summary_in_progress: None,
            translations: TranslationSet::default(),
            audio_path: None,
            folder_id: None,
            folder_name: None,
        }
    }

    #[test]
    fn test_unknown_status_defaults_to_processing() {
        assert_eq!(LectureStatus::parse("ready"), LectureStatus::Ready);
        assert_eq!(
            LectureStatus::parse("some_future_state"),
            LectureStatus::Processing
        );
        assert_eq!(LectureStatus::parse(""), LectureStatus::Processing);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            LectureStatus::Recording,
            LectureStatus::Processing,
            LectureStatus::Transcribed,
            LectureStatus::Summarizing,
            LectureStatus::Ready,
            LectureStatus::Failed,
            LectureStatus::BlockedQuota,
        ] {
            assert_eq!(LectureStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn test_decode_drops_bad_id() {
        assert!(doc("not-a-uuid", Some("ready")).decode().is_none());
    }

    #[test]
    fn test_decode_missing_status_is_processing() {
        let lecture = doc(&Uuid::new_v4().to_string(), None).decode().unwrap();
        assert_eq!(lecture.status, LectureStatus::Processing);
    }

    #[test]
    fn test_summary_without_transcript_is_dropped() {
        let mut raw = doc(&Uuid::new_v4().to_string(), Some("ready"));
        raw.summary = Some(LectureSummary {
            main_theme: "Patience".to_string(),
            key_points: vec![],
            references: vec![],
            weekly_actions: vec![],
        });

        let lecture = raw.decode().unwrap();
        assert!(lecture.summary.is_none());
    }

    #[test]
    fn test_summary_progress_legacy_boolean() {
        assert_eq!(
            SummaryProgress::from_value(&serde_json::json!(true)),
            Some(SummaryProgress {
                started_at: None,
                expires_at: None
            })
        );
        assert_eq!(SummaryProgress::from_value(&serde_json::json!(false)), None);
    }

    #[test]
    fn test_summary_progress_modern_form() {
        let started = Utc::now();
        let value = serde_json::json!({
            "started_at": started,
            "expires_at": null,
        });

        let progress = SummaryProgress::from_value(&value).unwrap();
        assert_eq!(progress.started_at, Some(started));
        assert_eq!(progress.expires_at, None);
    }

    #[test]
    fn test_finalize_patch_skips_absent_fields() {
        let patch = LecturePatch::failed("upload failed".to_string());
        let json = serde_json::to_value(&patch).unwrap();

        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["status"], "failed");
        assert_eq!(obj["error_message"], "upload failed");
    }
}
