//! Relaunch routes: deep-link tokens that survive a process restart.
//!
//! A route is written to shared storage when the app cannot act on it
//! immediately (e.g. "open the save card for lecture X" requested from a
//! notification) and picked up exactly once on next foreground.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque route tokens the shell layer knows how to follow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "route")]
pub enum RelaunchRoute {
    /// Navigate to the save-card screen for a lecture
    SaveCard { lecture_id: Uuid },

    /// Navigate to a lecture's detail view
    Lecture { lecture_id: Uuid },
}

/// File-backed route storage with set/take semantics
pub struct RelaunchStore {
    path: PathBuf,
}

impl RelaunchStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn open_default() -> anyhow::Result<Self> {
        Ok(Self::new(crate::config::relaunch_path()?))
    }

    /// Persist a route for pickup on next foreground, replacing any
    /// previously stored route.
    pub fn set(&self, route: &RelaunchRoute) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(route)?;
        std::fs::write(&self.path, json)
    }

    /// Consume the stored route, if any. Unreadable content is discarded.
    pub fn take(&self) -> Option<RelaunchRoute> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let _ = std::fs::remove_file(&self.path);
        serde_json::from_str(&content).ok()
    }
}
