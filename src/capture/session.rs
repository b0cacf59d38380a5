//! Capture session state machine and timing/level accounting.
//!
//! The session is deliberately free of any audio I/O so the accounting
//! rules are testable: `idle → recording ⇄ paused → idle`, elapsed time
//! accumulates only while recording, and the level signal reads 0 unless
//! actively recording.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// dBFS floor for level normalization
pub const LEVEL_FLOOR_DB: f32 = -80.0;

/// Level sampling interval (~8 ticks per second)
pub const LEVEL_TICK: Duration = Duration::from_millis(125);

/// Capture lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Recording,
    Paused,
}

/// Record/pause/resume/stop accounting.
///
/// The meter value is shared with the audio callback through an atomic;
/// the session only decides whether it is visible.
#[derive(Debug)]
pub struct CaptureSession {
    state: CaptureState,

    /// Time spent recording in completed segments
    accumulated: Duration,

    /// Start of the current recording segment, while in `Recording`
    segment_started: Option<Instant>,

    /// Latest meter value (f32 bits), written by the audio callback
    level_bits: Arc<AtomicU32>,
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSession {
    pub fn new() -> Self {
        Self {
            state: CaptureState::Idle,
            accumulated: Duration::ZERO,
            segment_started: None,
            level_bits: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Handle the audio callback writes its meter values through
    pub fn level_handle(&self) -> Arc<AtomicU32> {
        self.level_bits.clone()
    }

    /// Begin recording. No-op unless idle.
    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub(crate) fn start_at(&mut self, now: Instant) {
        if self.state != CaptureState::Idle {
            return;
        }
        self.accumulated = Duration::ZERO;
        self.segment_started = Some(now);
        self.state = CaptureState::Recording;
    }

    /// Freeze elapsed-time accumulation. No-op unless recording.
    pub fn pause(&mut self) {
        self.pause_at(Instant::now());
    }

    pub(crate) fn pause_at(&mut self, now: Instant) {
        if self.state != CaptureState::Recording {
            return;
        }
        if let Some(started) = self.segment_started.take() {
            self.accumulated += now.duration_since(started);
        }
        self.state = CaptureState::Paused;
    }

    /// Resume accumulation. No-op unless paused.
    pub fn resume(&mut self) {
        self.resume_at(Instant::now());
    }

    pub(crate) fn resume_at(&mut self, now: Instant) {
        if self.state != CaptureState::Paused {
            return;
        }
        self.segment_started = Some(now);
        self.state = CaptureState::Recording;
    }

    /// Return to idle, yielding the total recorded time. Returns None if
    /// nothing was recording or paused.
    pub fn stop(&mut self) -> Option<Duration> {
        self.stop_at(Instant::now())
    }

    pub(crate) fn stop_at(&mut self, now: Instant) -> Option<Duration> {
        if self.state == CaptureState::Idle {
            return None;
        }
        if let Some(started) = self.segment_started.take() {
            self.accumulated += now.duration_since(started);
        }
        let total = self.accumulated;

        self.state = CaptureState::Idle;
        self.accumulated = Duration::ZERO;
        self.level_bits.store(0, Ordering::Relaxed);

        Some(total)
    }

    /// Wall-clock time spent strictly in the recording state
    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    pub(crate) fn elapsed_at(&self, now: Instant) -> Duration {
        match self.segment_started {
            Some(started) if self.state == CaptureState::Recording => {
                self.accumulated + now.duration_since(started)
            }
            _ => self.accumulated,
        }
    }

    /// Normalized meter value in 0..1; forced to 0 unless recording.
    pub fn level(&self) -> f32 {
        if self.state != CaptureState::Recording {
            return 0.0;
        }
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }
}

/// Normalize an RMS sample to 0..1 through decibel metering with a
/// -80 dB floor.
pub fn normalized_level(rms: f32) -> f32 {
    if rms <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * rms.log10();
    let clamped = db.max(LEVEL_FLOOR_DB);
    ((clamped - LEVEL_FLOOR_DB) / -LEVEL_FLOOR_DB).clamp(0.0, 1.0)
}
