//! Microphone capture: cpal input stream feeding a WAV file.
//!
//! The stream lives on its own thread because cpal streams are not Send;
//! the thread owns the device and writer and runs until told to stop.
//! Meter values flow back through the session's atomic handle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::session::{normalized_level, CaptureSession, CaptureState};

/// Errors surfaced by the capture engine
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Microphone permission has been denied; the caller must re-grant
    /// and invoke start_capture again
    #[error("Microphone permission denied")]
    PermissionDenied,

    /// Device or stream setup failed
    #[error("Failed to start capture: {0}")]
    FailedToStart(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Microphone permission as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Undetermined,
    Granted,
    Denied,
}

/// Platform permission seam. Desktop hosts grant implicitly; tests can
/// script denial.
#[async_trait]
pub trait PermissionProbe: Send + Sync {
    fn state(&self) -> PermissionState;

    /// Ask the platform for access. Only meaningful from `Undetermined`.
    async fn request(&self) -> PermissionState;
}

/// Default desktop probe: access is granted at the OS level
pub struct AlwaysGranted;

#[async_trait]
impl PermissionProbe for AlwaysGranted {
    fn state(&self) -> PermissionState {
        PermissionState::Granted
    }

    async fn request(&self) -> PermissionState {
        PermissionState::Granted
    }
}

/// A finished capture ready for upload
#[derive(Debug, Clone)]
pub struct FinishedCapture {
    pub path: PathBuf,
    pub duration: Duration,
}

struct ActiveCapture {
    path: PathBuf,
    stop_flag: Arc<AtomicBool>,
    paused_flag: Arc<AtomicBool>,
    worker: thread::JoinHandle<()>,
}

/// Owns the microphone session: record/pause/resume/stop plus live
/// amplitude and elapsed-time signals.
pub struct AudioCapture {
    permission: Arc<dyn PermissionProbe>,
    session: Mutex<CaptureSession>,
    scratch_dir: PathBuf,
    active: Mutex<Option<ActiveCapture>>,
}

impl AudioCapture {
    pub fn new(permission: Arc<dyn PermissionProbe>, scratch_dir: PathBuf) -> Self {
        Self {
            permission,
            session: Mutex::new(CaptureSession::new()),
            scratch_dir,
            active: Mutex::new(None),
        }
    }

    /// Current capture state
    pub fn state(&self) -> CaptureState {
        self.session.lock().unwrap().state()
    }

    /// Wall-clock time spent strictly recording, excluding paused intervals
    pub fn elapsed(&self) -> Duration {
        self.session.lock().unwrap().elapsed()
    }

    /// Normalized 0..1 level; 0 while paused or idle
    pub fn level(&self) -> f32 {
        self.session.lock().unwrap().level()
    }

    /// Begin a capture into a fresh temp file.
    ///
    /// Requires microphone permission: an outright denial fails with
    /// `PermissionDenied`; an undetermined state triggers an async
    /// request and, if the user declines, the call is a no-op (the
    /// session stays idle).
    pub async fn start_capture(&self) -> Result<(), CaptureError> {
        match self.permission.state() {
            PermissionState::Denied => return Err(CaptureError::PermissionDenied),
            PermissionState::Undetermined => {
                if self.permission.request().await != PermissionState::Granted {
                    warn!("Microphone permission request declined");
                    return Ok(());
                }
            }
            PermissionState::Granted => {}
        }

        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.scratch_dir)?;
        let path = self.scratch_dir.join(format!("{}.wav", Uuid::new_v4()));

        let level_handle = self.session.lock().unwrap().level_handle();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let paused_flag = Arc::new(AtomicBool::new(false));

        let worker = spawn_capture_thread(
            path.clone(),
            level_handle,
            stop_flag.clone(),
            paused_flag.clone(),
        )?;

        self.session.lock().unwrap().start();
        *active = Some(ActiveCapture {
            path,
            stop_flag,
            paused_flag,
            worker,
        });

        info!("Capture started");
        Ok(())
    }

    /// No-op unless recording
    pub fn pause(&self) {
        // Lock order: active before session, matching start_capture
        let active = self.active.lock().unwrap();
        let mut session = self.session.lock().unwrap();
        if session.state() != CaptureState::Recording {
            return;
        }
        session.pause();
        if let Some(ref active) = *active {
            active.paused_flag.store(true, Ordering::SeqCst);
        }
    }

    /// No-op unless paused
    pub fn resume(&self) {
        let active = self.active.lock().unwrap();
        let mut session = self.session.lock().unwrap();
        if session.state() != CaptureState::Paused {
            return;
        }
        session.resume();
        if let Some(ref active) = *active {
            active.paused_flag.store(false, Ordering::SeqCst);
        }
    }

    /// Finish the capture, deactivating the stream and resetting all
    /// counters. Returns None if nothing was recording.
    pub fn stop(&self) -> Option<FinishedCapture> {
        let duration = self.session.lock().unwrap().stop()?;

        let active = self.active.lock().unwrap().take()?;
        active.stop_flag.store(true, Ordering::SeqCst);
        if active.worker.join().is_err() {
            error!("Capture worker panicked");
        }

        info!(duration_secs = duration.as_secs(), "Capture stopped");
        Some(FinishedCapture {
            path: active.path,
            duration,
        })
    }
}

/// Spawn the thread that owns the cpal stream and WAV writer
fn spawn_capture_thread(
    path: PathBuf,
    level_bits: Arc<AtomicU32>,
    stop_flag: Arc<AtomicBool>,
    paused_flag: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>, CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::FailedToStart("No input device available".to_string()))?;

    let config = device
        .default_input_config()
        .map_err(|e| CaptureError::FailedToStart(e.to_string()))?;

    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let writer = hound::WavWriter::create(&path, spec)
        .map_err(|e| CaptureError::FailedToStart(e.to_string()))?;
    let writer = Arc::new(Mutex::new(Some(writer)));

    let handle = thread::spawn(move || {
        let callback_writer = writer.clone();
        let callback_paused = paused_flag.clone();

        let stream = device.build_input_stream(
            &config.into(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if callback_paused.load(Ordering::SeqCst) {
                    return;
                }

                // Downmix to mono
                let mono: Vec<f32> = if channels > 1 {
                    data.chunks(channels)
                        .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
                        .collect()
                } else {
                    data.to_vec()
                };

                if !mono.is_empty() {
                    let sum_squares: f32 = mono.iter().map(|s| s * s).sum();
                    let rms = (sum_squares / mono.len() as f32).sqrt();
                    level_bits.store(normalized_level(rms).to_bits(), Ordering::Relaxed);
                }

                if let Some(writer) = callback_writer.lock().unwrap().as_mut() {
                    for sample in &mono {
                        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                        let _ = writer.write_sample(value);
                    }
                }
            },
            |err| error!(error = %err, "Capture stream error"),
            None,
        );

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "Failed to build input stream");
                return;
            }
        };

        if let Err(e) = stream.play() {
            error!(error = %e, "Failed to start input stream");
            return;
        }

        while !stop_flag.load(Ordering::SeqCst) {
            thread::sleep(super::session::LEVEL_TICK);
        }

        drop(stream);
        if let Some(writer) = writer.lock().unwrap().take() {
            if let Err(e) = writer.finalize() {
                error!(error = %e, "Failed to finalize WAV file");
            }
        }
    });

    Ok(handle)
}
