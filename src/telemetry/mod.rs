//! Cross-stage correlation and analytics.
//!
//! This module contains:
//! - Context: per-phase correlation bookkeeping and the error taxonomy
//! - Journal: append-only JSONL persistence of emitted events
//! - Ledger: the snapshot-diffing engine that stitches upload,
//!   transcription and summarization into one coherent operation

pub mod context;
pub mod journal;
pub mod ledger;

// Re-export commonly used types
pub use context::{
    CorrelationIds, Phase, PhaseErrorCode, SummarizationContext, TranscriptionContext,
    UploadContext,
};
pub use journal::TelemetryJournal;
pub use ledger::{PhaseEvent, PhaseEventKind, PipelineTelemetryLedger};
