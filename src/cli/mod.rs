//! Command-line interface for lectern.
//!
//! Provides commands for recording, importing and retrying uploads,
//! inspecting the merged lecture list, recovering after a crash, and
//! account deletion.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::capture::{AlwaysGranted, AudioCapture, CaptureState};
use crate::config;
use crate::domain::UploadTrigger;
use crate::reconcile::LectureStateReconciler;
use crate::remote::{AuthProvider, HttpRemote};
use crate::store::PendingStore;
use crate::telemetry::{PipelineTelemetryLedger, TelemetryJournal};
use crate::upload::{UploadOrchestrator, UploadRequest};

/// lectern - recording-to-durable-artifact pipeline
#[derive(Parser, Debug)]
#[command(name = "lectern")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Backend base URL
    #[arg(long, env = "LECTERN_API_URL", default_value = "http://localhost:8787")]
    pub api_url: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record a lecture from the microphone and upload it
    Record {
        /// Lecture title
        #[arg(short, long)]
        title: String,
    },

    /// Upload an existing audio file
    Import {
        /// Path to the audio file
        file: PathBuf,

        /// Lecture title (defaults to the file name)
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Show the merged lecture list
    List,

    /// Follow the live snapshot feed and print updates
    Watch,

    /// Retry a failed upload
    Retry {
        /// Lecture ID (UUID)
        lecture_id: String,
    },

    /// Re-request summarization for a stuck or failed lecture
    RetrySummary {
        /// Lecture ID (UUID)
        lecture_id: String,
    },

    /// Resume pending uploads left over from a previous run
    Recover,

    /// Show pending uploads and quota usage
    Status,

    /// Delete all server-side data for this account
    DeleteAccount {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

/// Everything a command needs, wired once per invocation
struct Session {
    remote: Arc<HttpRemote>,
    user_id: String,
    orchestrator: Arc<UploadOrchestrator>,
    reconciler: Arc<LectureStateReconciler>,
    store: Arc<PendingStore>,
}

impl Session {
    async fn connect(api_url: &str) -> Result<Self> {
        let remote = Arc::new(HttpRemote::new(api_url));
        let user_id = remote
            .sign_in_anonymously()
            .await
            .context("Failed to sign in")?;

        let store = Arc::new(PendingStore::open_default()?);
        let journal = TelemetryJournal::open_default(&user_id).await?;
        let ledger = Arc::new(PipelineTelemetryLedger::new(Some(journal)));
        let policy = config::config()?.policy.clone();

        let orchestrator = Arc::new(UploadOrchestrator::new(
            user_id.clone(),
            remote.clone(),
            remote.clone(),
            store.clone(),
            ledger.clone(),
            policy.clone(),
            config::captures_dir()?,
        ));

        let reconciler = Arc::new(LectureStateReconciler::new(
            orchestrator.clone(),
            remote.clone(),
            remote.clone(),
            ledger,
            policy,
        ));

        Ok(Self {
            remote,
            user_id,
            orchestrator,
            reconciler,
            store,
        })
    }

    fn parse_lecture_id(raw: &str) -> Result<Uuid> {
        Uuid::parse_str(raw).with_context(|| format!("Invalid lecture id: {}", raw))
    }
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let session = Session::connect(&self.api_url).await?;

        match self.command {
            Commands::Record { title } => execute_record(&session, title).await,
            Commands::Import { file, title } => execute_import(&session, file, title).await,
            Commands::List => execute_list(&session).await,
            Commands::Watch => execute_watch(&session).await,
            Commands::Retry { lecture_id } => {
                let id = Session::parse_lecture_id(&lecture_id)?;
                session.orchestrator.retry_upload(id).await?;
                println!("Upload retried for {}", id);
                Ok(())
            }
            Commands::RetrySummary { lecture_id } => {
                let id = Session::parse_lecture_id(&lecture_id)?;
                session.reconciler.retry_summary(id).await?;
                println!("Summary re-requested for {}", id);
                Ok(())
            }
            Commands::Recover => {
                let resumed = session.orchestrator.restore_pending_recordings().await?;
                println!("Resumed {} pending upload(s)", resumed.len());
                Ok(())
            }
            Commands::Status => execute_status(&session).await,
            Commands::DeleteAccount { yes } => execute_delete_account(&session, yes).await,
        }
    }
}

/// Record from the microphone until the user stops, then upload.
async fn execute_record(session: &Session, title: String) -> Result<()> {
    let capture = AudioCapture::new(Arc::new(AlwaysGranted), config::captures_dir()?);
    capture.start_capture().await?;

    if capture.state() != CaptureState::Recording {
        println!("Microphone not available; nothing recorded.");
        return Ok(());
    }

    println!("Recording '{}'", title);
    println!("  [p] pause   [r] resume   [Enter] stop");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "p" => {
                capture.pause();
                println!("Paused at {:?}", capture.elapsed());
            }
            "r" => {
                capture.resume();
                println!("Resumed");
            }
            "" => break,
            other => println!("Unknown command: {}", other),
        }
    }

    let Some(finished) = capture.stop() else {
        println!("Nothing was recorded.");
        return Ok(());
    };

    println!(
        "Captured {:?} to {}",
        finished.duration,
        finished.path.display()
    );

    let request = UploadRequest {
        lecture_id: Uuid::new_v4(),
        title,
        captured_at: chrono::Utc::now(),
        source: finished.path,
        trigger: UploadTrigger::Recording,
        duration_estimate: Some(finished.duration),
    };

    let lecture_id = request.lecture_id;
    session.orchestrator.begin_upload(request).await?;
    println!("Uploaded. Lecture id: {}", lecture_id);

    Ok(())
}

async fn execute_import(session: &Session, file: PathBuf, title: Option<String>) -> Result<()> {
    let title = title.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "Imported lecture".to_string())
    });

    let request = UploadRequest {
        lecture_id: Uuid::new_v4(),
        title,
        captured_at: chrono::Utc::now(),
        source: file,
        trigger: UploadTrigger::FilePick,
        duration_estimate: None,
    };

    let lecture_id = request.lecture_id;
    session.orchestrator.begin_upload(request).await?;
    println!("Uploaded. Lecture id: {}", lecture_id);

    Ok(())
}

async fn execute_list(session: &Session) -> Result<()> {
    use crate::remote::DocumentStore;

    let remote = session.remote.fetch_lectures(&session.user_id).await?;
    let merged = session.reconciler.apply_snapshot(remote).await;

    if merged.is_empty() {
        println!("No lectures yet.");
        return Ok(());
    }

    println!();
    println!("{:<38} {:<14} {:<8} TITLE", "ID", "STATUS", "MIN");
    for lecture in &merged {
        println!(
            "{:<38} {:<14} {:<8} {}",
            lecture.id,
            lecture.status.as_str(),
            lecture
                .duration_minutes
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".to_string()),
            lecture.title,
        );
        if let Some(ref message) = lecture.error_message {
            println!("{:<38} {}", "", message);
        }
    }
    println!();

    Ok(())
}

/// Consume the live feed, printing each reconciled view as it lands.
/// Snapshots are processed strictly in arrival order.
async fn execute_watch(session: &Session) -> Result<()> {
    use crate::remote::DocumentStore;

    let mut feed = session.remote.subscribe(&session.user_id);
    println!("Watching for updates (Ctrl-C to stop)");

    while let Some(snapshot) = feed.recv().await {
        let merged = session.reconciler.apply_snapshot(snapshot).await;
        println!();
        println!("-- {} lecture(s) --", merged.len());
        for lecture in &merged {
            println!("  [{}] {}", lecture.status.as_str(), lecture.title);
        }
    }

    Ok(())
}

async fn execute_status(session: &Session) -> Result<()> {
    use crate::remote::DocumentStore;

    let pending = session.store.load(&session.user_id)?;
    let quota = session.remote.fetch_profile(&session.user_id).await?;
    let policy = &config::config()?.policy;

    println!();
    println!("User: {}", session.user_id);
    println!();
    println!("Pending uploads: {}", pending.len());
    for record in &pending {
        println!(
            "  {} '{}' ({}{})",
            record.lecture_id,
            record.title,
            record.local_path.display(),
            if record.blob_uploaded {
                ", blob uploaded"
            } else {
                ""
            }
        );
    }
    println!();
    println!(
        "Plan: {:?}  Remaining minutes: {}",
        quota.plan,
        quota.remaining_minutes(policy)
    );
    println!();

    Ok(())
}

/// Delete all server-side user data. Local state is only cleared after
/// the endpoint returns success.
async fn execute_delete_account(session: &Session, yes: bool) -> Result<()> {
    if !yes {
        println!("This permanently deletes all server-side data for this account.");
        println!("Re-run with --yes to confirm.");
        return Ok(());
    }

    let token = session.remote.id_token(true).await?;
    session
        .remote
        .delete_account(&token)
        .await
        .context("Account deletion failed; local state kept")?;

    // The endpoint returned 200: now it is safe to clear local state
    session.store.replace(&[], &session.user_id)?;
    session.remote.sign_out().await?;
    println!("Account deleted.");

    Ok(())
}
