//! Microphone capture.
//!
//! Split in two layers:
//! - `session`: the record/pause/resume/stop state machine with
//!   elapsed-time and level accounting (no audio I/O)
//! - `recorder`: the cpal input stream and WAV writer driving a session

pub mod recorder;
pub mod session;

// Re-export key types
pub use recorder::{
    AlwaysGranted, AudioCapture, CaptureError, FinishedCapture, PermissionProbe, PermissionState,
};
pub use session::{normalized_level, CaptureSession, CaptureState, LEVEL_TICK};
