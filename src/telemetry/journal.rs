//! Append-only telemetry journal with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) per user for
//! simplicity and easy inspection. The journal is write-mostly; replay
//! exists for downstream analysis and tests.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::ledger::PhaseEvent;

/// File-based telemetry journal using JSONL format
pub struct TelemetryJournal {
    events_path: PathBuf,
}

impl TelemetryJournal {
    /// Create or open the journal for a user
    pub async fn open(base_dir: &Path, user_id: &str) -> Result<Self> {
        fs::create_dir_all(base_dir)
            .await
            .with_context(|| format!("Failed to create journal directory: {}", base_dir.display()))?;

        Ok(Self {
            events_path: base_dir.join(format!("{}.jsonl", user_id)),
        })
    }

    /// Open the journal in the configured location ($LECTERN_HOME/telemetry)
    pub async fn open_default(user_id: &str) -> Result<Self> {
        let base_dir = crate::config::telemetry_dir()?;
        Self::open(&base_dir, user_id).await
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Append an event to the log
    pub async fn append(&self, event: &PhaseEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open journal file: {}",
                    self.events_path.display()
                )
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<PhaseEvent>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open journal file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: PhaseEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Find events matching a predicate
    pub async fn find_events<F>(&self, predicate: F) -> Result<Vec<PhaseEvent>>
    where
        F: Fn(&PhaseEvent) -> bool,
    {
        let events = self.replay().await?;
        Ok(events.into_iter().filter(predicate).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::context::{CorrelationIds, Phase};
    use crate::telemetry::ledger::PhaseEventKind;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn event(lecture_id: Uuid, phase: Phase, kind: PhaseEventKind) -> PhaseEvent {
        PhaseEvent {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            lecture_id,
            phase,
            kind,
            correlation: CorrelationIds::default(),
            retries_count: None,
            bytes: None,
            chars: None,
            resumed: false,
            error_code: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_replay_order() {
        let temp = TempDir::new().unwrap();
        let journal = TelemetryJournal::open(temp.path(), "user-1").await.unwrap();

        let lecture = Uuid::new_v4();
        journal
            .append(&event(lecture, Phase::Upload, PhaseEventKind::Attempt))
            .await
            .unwrap();
        journal
            .append(&event(lecture, Phase::Upload, PhaseEventKind::Sent))
            .await
            .unwrap();
        journal
            .append(&event(lecture, Phase::Upload, PhaseEventKind::Success))
            .await
            .unwrap();

        let events = journal.replay().await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, PhaseEventKind::Attempt);
        assert_eq!(events[1].kind, PhaseEventKind::Sent);
        assert_eq!(events[2].kind, PhaseEventKind::Success);
    }

    #[tokio::test]
    async fn test_journals_are_per_user() {
        let temp = TempDir::new().unwrap();
        let journal_a = TelemetryJournal::open(temp.path(), "user-a").await.unwrap();
        let journal_b = TelemetryJournal::open(temp.path(), "user-b").await.unwrap();

        journal_a
            .append(&event(Uuid::new_v4(), Phase::Upload, PhaseEventKind::Attempt))
            .await
            .unwrap();

        assert_eq!(journal_a.replay().await.unwrap().len(), 1);
        assert!(journal_b.replay().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_events() {
        let temp = TempDir::new().unwrap();
        let journal = TelemetryJournal::open(temp.path(), "user-1").await.unwrap();

        let lecture = Uuid::new_v4();
        journal
            .append(&event(lecture, Phase::Transcription, PhaseEventKind::Success))
            .await
            .unwrap();
        journal
            .append(&event(lecture, Phase::Summarization, PhaseEventKind::Success))
            .await
            .unwrap();

        let found = journal
            .find_events(|e| e.phase == Phase::Transcription)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
