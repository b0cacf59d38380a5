//! Correlation contexts and the per-phase error taxonomy.
//!
//! A context is the ephemeral bookkeeping for one phase of one lecture:
//! a locally generated opaque identifier plus timestamps and counters.
//! Contexts are never persisted; a process restart loses correlation but
//! not the underlying pending upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::remote::RemoteError;
use crate::upload::PreparationError;

/// The three asynchronous, independently failing phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Upload,
    Transcription,
    Summarization,
}

/// Closed error-code set shared by all phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseErrorCode {
    Auth,
    Network,
    Timeout,
    Server,
    Client,
    Quota,
    InvalidMedia,
    Canceled,
    Unknown,
}

impl PhaseErrorCode {
    /// Retryability is a pure function of the code
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Server)
    }

    pub fn from_remote(error: &RemoteError) -> Self {
        match error {
            RemoteError::Network(_) => Self::Network,
            RemoteError::Timeout(_) => Self::Timeout,
            RemoteError::Auth(_) => Self::Auth,
            RemoteError::Quota { .. } => Self::Quota,
            RemoteError::Server { .. } => Self::Server,
            RemoteError::Client { .. } => Self::Client,
            RemoteError::Unknown(_) => Self::Unknown,
        }
    }

    pub fn from_preparation(_error: &PreparationError) -> Self {
        Self::InvalidMedia
    }
}

/// Identifiers joining one physical recording's phases downstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIds {
    pub upload_id: Option<Uuid>,
    pub transcription_id: Option<Uuid>,
    pub summarization_id: Option<Uuid>,
}

/// Open upload-phase bookkeeping
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub id: Uuid,
    pub lecture_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub sent: bool,
    pub bytes: Option<u64>,
    pub retries: u32,
    /// Whether this attempt is a crash-recovery resume
    pub resumed: bool,
}

impl UploadContext {
    pub fn new(lecture_id: Uuid, resumed: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            lecture_id,
            started_at: Utc::now(),
            sent: false,
            bytes: None,
            retries: 0,
            resumed,
        }
    }
}

/// Open transcription-phase bookkeeping; carries the upload that
/// produced its input when still known
#[derive(Debug, Clone)]
pub struct TranscriptionContext {
    pub id: Uuid,
    pub lecture_id: Uuid,
    pub upload_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub sent: bool,
}

impl TranscriptionContext {
    pub fn new(lecture_id: Uuid, upload_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lecture_id,
            upload_id,
            started_at: Utc::now(),
            sent: false,
        }
    }

    pub fn correlation(&self) -> CorrelationIds {
        CorrelationIds {
            upload_id: self.upload_id,
            transcription_id: Some(self.id),
            summarization_id: None,
        }
    }
}

/// Open summarization-phase bookkeeping; carries both predecessors
#[derive(Debug, Clone)]
pub struct SummarizationContext {
    pub id: Uuid,
    pub lecture_id: Uuid,
    pub upload_id: Option<Uuid>,
    pub transcription_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub sent: bool,
}

impl SummarizationContext {
    pub fn new(lecture_id: Uuid, upload_id: Option<Uuid>, transcription_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lecture_id,
            upload_id,
            transcription_id,
            started_at: Utc::now(),
            sent: false,
        }
    }

    pub fn correlation(&self) -> CorrelationIds {
        CorrelationIds {
            upload_id: self.upload_id,
            transcription_id: self.transcription_id,
            summarization_id: Some(self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_is_pure_in_the_code() {
        assert!(PhaseErrorCode::Network.is_retryable());
        assert!(PhaseErrorCode::Timeout.is_retryable());
        assert!(PhaseErrorCode::Server.is_retryable());

        for code in [
            PhaseErrorCode::Auth,
            PhaseErrorCode::Client,
            PhaseErrorCode::Quota,
            PhaseErrorCode::InvalidMedia,
            PhaseErrorCode::Canceled,
            PhaseErrorCode::Unknown,
        ] {
            assert!(!code.is_retryable(), "{:?} must not be retryable", code);
        }
    }

    #[test]
    fn test_remote_error_mapping() {
        assert_eq!(
            PhaseErrorCode::from_remote(&RemoteError::Quota {
                reason: "monthly_cap".into()
            }),
            PhaseErrorCode::Quota
        );
        assert_eq!(
            PhaseErrorCode::from_remote(&RemoteError::Server {
                status: 500,
                message: String::new()
            }),
            PhaseErrorCode::Server
        );
    }

    #[test]
    fn test_contexts_get_fresh_identifiers() {
        let lecture = Uuid::new_v4();
        let a = UploadContext::new(lecture, false);
        let b = UploadContext::new(lecture, false);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_summarization_carries_predecessors() {
        let lecture = Uuid::new_v4();
        let upload = Uuid::new_v4();
        let transcription = Uuid::new_v4();

        let context = SummarizationContext::new(lecture, Some(upload), Some(transcription));
        let correlation = context.correlation();

        assert_eq!(correlation.upload_id, Some(upload));
        assert_eq!(correlation.transcription_id, Some(transcription));
        assert_eq!(correlation.summarization_id, Some(context.id));
    }
}
