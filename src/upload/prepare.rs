//! Upload preparation: validation, transcode, duration probe.
//!
//! Everything here runs before the first network call. Failures are
//! terminal for the attempt and do not consume the retry budget. The
//! canonical container is m4a; other accepted formats are transcoded via
//! ffmpeg into an isolated temp file and re-validated.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Policy;

/// Accepted source file extensions
pub const ALLOWED_EXTENSIONS: &[&str] = &["m4a", "mp3", "wav", "aac", "flac", "ogg"];

/// Canonical upload container
pub const CANONICAL_EXTENSION: &str = "m4a";

/// Content type of the canonical container
pub const CANONICAL_CONTENT_TYPE: &str = "audio/mp4";

/// How long a transcode or probe may run
const TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Preparation failures, surfaced verbatim to the user
#[derive(Debug, Error)]
pub enum PreparationError {
    #[error("Unsupported file type: .{0}")]
    UnsupportedType(String),

    #[error("File too large: {actual} bytes exceeds the {limit} byte limit")]
    FileTooLarge { actual: u64, limit: u64 },

    #[error("File is not readable: {0}")]
    Unreadable(String),

    #[error("Transcode failed: {0}")]
    TranscodeFailed(String),
}

/// A validated, canonically encoded file ready for the blob store
#[derive(Debug, Clone)]
pub struct PreparedAudio {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Whether a transcode produced an intermediate file
    pub transcoded: bool,
}

fn ffmpeg_path() -> String {
    std::env::var("LECTERN_FFMPEG").unwrap_or_else(|_| "ffmpeg".to_string())
}

fn ffprobe_path() -> String {
    std::env::var("LECTERN_FFPROBE").unwrap_or_else(|_| "ffprobe".to_string())
}

fn extension_of(path: &Path) -> Result<String, PreparationError> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .ok_or_else(|| PreparationError::UnsupportedType(String::new()))
}

fn validate_size(path: &Path, policy: &Policy) -> Result<u64, PreparationError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| PreparationError::Unreadable(format!("{}: {}", path.display(), e)))?;

    let size = metadata.len();
    if size > policy.max_upload_bytes {
        return Err(PreparationError::FileTooLarge {
            actual: size,
            limit: policy.max_upload_bytes,
        });
    }

    Ok(size)
}

/// Validate a source file and, when it is not already in the canonical
/// container, transcode it into `scratch_dir`. Size limits are enforced
/// both before and after the transcode.
pub async fn prepare(
    source: &Path,
    lecture_id: Uuid,
    scratch_dir: &Path,
    policy: &Policy,
) -> Result<PreparedAudio, PreparationError> {
    let extension = extension_of(source)?;
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(PreparationError::UnsupportedType(extension));
    }

    let size_bytes = validate_size(source, policy)?;

    if extension == CANONICAL_EXTENSION {
        debug!(path = %source.display(), "Source already canonical, skipping transcode");
        return Ok(PreparedAudio {
            path: source.to_path_buf(),
            size_bytes,
            transcoded: false,
        });
    }

    let prepared = transcode(source, lecture_id, scratch_dir).await?;
    let size_bytes = validate_size(&prepared, policy)?;

    info!(
        source = %source.display(),
        prepared = %prepared.display(),
        size_bytes,
        "Transcoded to canonical container"
    );

    Ok(PreparedAudio {
        path: prepared,
        size_bytes,
        transcoded: true,
    })
}

/// Transcode into an isolated temp file, then move it into place so a
/// half-written output is never picked up by a retry.
async fn transcode(
    source: &Path,
    lecture_id: Uuid,
    scratch_dir: &Path,
) -> Result<PathBuf, PreparationError> {
    std::fs::create_dir_all(scratch_dir)
        .map_err(|e| PreparationError::TranscodeFailed(e.to_string()))?;

    let work_path = scratch_dir.join(format!(".{}.tmp.{}", lecture_id, CANONICAL_EXTENSION));
    let final_path = scratch_dir.join(format!("{}.{}", lecture_id, CANONICAL_EXTENSION));

    let output = tokio::time::timeout(
        TOOL_TIMEOUT,
        Command::new(ffmpeg_path())
            .arg("-y")
            .arg("-i")
            .arg(source)
            .args(["-vn", "-c:a", "aac", "-b:a", "128k"])
            .arg(&work_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .map_err(|_| PreparationError::TranscodeFailed("ffmpeg timed out".to_string()))?
    .map_err(|e| PreparationError::TranscodeFailed(format!("failed to run ffmpeg: {}", e)))?;

    if !output.status.success() {
        let _ = std::fs::remove_file(&work_path);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PreparationError::TranscodeFailed(
            stderr.trim().lines().last().unwrap_or("unknown").to_string(),
        ));
    }

    std::fs::rename(&work_path, &final_path)
        .map_err(|e| PreparationError::TranscodeFailed(e.to_string()))?;

    Ok(final_path)
}

/// Content identity of the uploaded bytes (SHA256, first 12 hex chars).
/// Stable across retries of the same prepared file.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    format!("{:x}", result)[..12].to_string()
}

/// Probe media duration via ffprobe. Accepts local paths and URLs.
pub async fn probe_duration(source: &str) -> anyhow::Result<Duration> {
    let output = tokio::time::timeout(
        TOOL_TIMEOUT,
        Command::new(ffprobe_path())
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "csv=p=0",
            ])
            .arg(source)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("ffprobe timed out"))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffprobe failed: {}", stderr.trim());
    }

    let seconds: f64 = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("unparseable ffprobe output: {}", e))?;

    Ok(Duration::from_secs_f64(seconds.max(0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, size: usize) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, vec![0u8; size]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_unsupported_extension_rejected() {
        let temp = TempDir::new().unwrap();
        let source = write_file(&temp, "notes.txt", 10);

        let err = prepare(&source, Uuid::new_v4(), temp.path(), &Policy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PreparationError::UnsupportedType(ext) if ext == "txt"));
    }

    #[tokio::test]
    async fn test_oversized_file_rejected_before_any_network_call() {
        let temp = TempDir::new().unwrap();
        let policy = Policy {
            max_upload_bytes: 1024,
            ..Policy::default()
        };
        let source = write_file(&temp, "big.m4a", 2048);

        let err = prepare(&source, Uuid::new_v4(), temp.path(), &policy)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PreparationError::FileTooLarge {
                actual: 2048,
                limit: 1024
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_file_is_unreadable() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("gone.m4a");

        let err = prepare(&source, Uuid::new_v4(), temp.path(), &Policy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PreparationError::Unreadable(_)));
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = content_hash(b"same bytes");
        let b = content_hash(b"same bytes");
        let c = content_hash(b"different bytes");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_canonical_source_skips_transcode() {
        let temp = TempDir::new().unwrap();
        let source = write_file(&temp, "talk.m4a", 128);

        let prepared = prepare(&source, Uuid::new_v4(), temp.path(), &Policy::default())
            .await
            .unwrap();
        assert_eq!(prepared.path, source);
        assert_eq!(prepared.size_bytes, 128);
        assert!(!prepared.transcoded);
    }
}
