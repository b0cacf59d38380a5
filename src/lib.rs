//! lectern - recording-to-durable-artifact pipeline
//!
//! Captures a spoken lecture as audio, uploads it reliably to a remote
//! store, and tracks its progress through an external transcription and
//! summarization pipeline until a final artifact is ready.
//!
//! # Architecture
//!
//! - Captures produce a local file plus a durable pending record before
//!   any network call
//! - The upload orchestrator drives prepare → blob write → metadata
//!   finalize with bounded retries, and resumes from the pending store
//!   after a crash
//! - The reconciler merges the authoritative remote snapshot with
//!   still-pending local state into one ordered view
//! - The telemetry ledger stitches upload, transcription and
//!   summarization into one correlated operation by diffing snapshots
//!
//! # Modules
//!
//! - `capture`: microphone session and state machine
//! - `domain`: lectures, pending uploads, quota
//! - `store`: durable local state (pending records, relaunch routes)
//! - `remote`: document store / blob store / auth seams
//! - `upload`: the crash-recoverable upload pipeline
//! - `reconcile`: merged lecture view and summary-retry eligibility
//! - `telemetry`: correlation contexts, lifecycle events, journal
//! - `cli`: command-line driver

pub mod capture;
pub mod cli;
pub mod config;
pub mod domain;
pub mod reconcile;
pub mod remote;
pub mod store;
pub mod telemetry;
pub mod upload;

// Re-export main types at crate root for convenience
pub use capture::{AudioCapture, CaptureState};
pub use domain::{Lecture, LectureStatus, PendingUploadRecord, UploadTrigger};
pub use reconcile::LectureStateReconciler;
pub use remote::{AuthProvider, BlobStore, DocumentStore, RemoteError};
pub use store::{PendingStore, RelaunchRoute, RelaunchStore};
pub use telemetry::{PhaseEvent, PhaseEventKind, PipelineTelemetryLedger};
pub use upload::{UploadError, UploadOrchestrator, UploadRequest};
