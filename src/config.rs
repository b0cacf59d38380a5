//! Configuration for lectern paths and upload policy.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (LECTERN_HOME)
//! 2. Config file (.lectern/config.yaml)
//! 3. Defaults (~/.lectern)
//!
//! Config file discovery:
//! - Searches current directory and parents for .lectern/config.yaml
//! - Paths in config file are relative to the config file's parent directory
//!
//! Policy values (upload size ceiling, retry delays, summary TTL, quota
//! caps) mirror server-side enforcement and are configuration, not code.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub policy: Option<PolicyConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to config file)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub max_upload_bytes: Option<u64>,
    pub retry_delays_secs: Option<Vec<u64>>,
    pub max_upload_attempts: Option<u32>,
    pub summary_ttl_minutes: Option<i64>,
    pub per_recording_cap_minutes: Option<u32>,
    pub monthly_cap_minutes: Option<u32>,
    pub lifetime_cap_minutes: Option<u32>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to lectern home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Upload/quota policy
    pub policy: Policy,
}

/// Policy constants mirrored from server-side enforcement
#[derive(Debug, Clone)]
pub struct Policy {
    /// Maximum accepted audio file size in bytes
    pub max_upload_bytes: u64,
    /// Backoff delays between blob-upload attempts; clamped to last entry
    pub retry_delays: Vec<Duration>,
    /// Maximum blob-upload attempts per explicit upload lifecycle
    pub max_upload_attempts: u32,
    /// How long a summarization job may run before it counts as stuck
    pub summary_ttl: chrono::Duration,
    /// Per-recording length cap in minutes
    pub per_recording_cap_minutes: u32,
    /// Monthly processed-minutes cap
    pub monthly_cap_minutes: u32,
    /// Lifetime processed-minutes cap (free tier)
    pub lifetime_cap_minutes: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_upload_bytes: 100 * 1024 * 1024, // 100MB
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(9),
            ],
            max_upload_attempts: 3,
            summary_ttl: chrono::Duration::minutes(15),
            per_recording_cap_minutes: 90,
            monthly_cap_minutes: 300,
            lifetime_cap_minutes: 60,
        }
    }
}

impl Policy {
    fn from_file(config: Option<&PolicyConfig>) -> Self {
        let defaults = Self::default();
        let Some(config) = config else {
            return defaults;
        };

        Self {
            max_upload_bytes: config.max_upload_bytes.unwrap_or(defaults.max_upload_bytes),
            retry_delays: config
                .retry_delays_secs
                .as_ref()
                .map(|secs| secs.iter().map(|s| Duration::from_secs(*s)).collect())
                .unwrap_or(defaults.retry_delays),
            max_upload_attempts: config
                .max_upload_attempts
                .unwrap_or(defaults.max_upload_attempts),
            summary_ttl: config
                .summary_ttl_minutes
                .map(chrono::Duration::minutes)
                .unwrap_or(defaults.summary_ttl),
            per_recording_cap_minutes: config
                .per_recording_cap_minutes
                .unwrap_or(defaults.per_recording_cap_minutes),
            monthly_cap_minutes: config
                .monthly_cap_minutes
                .unwrap_or(defaults.monthly_cap_minutes),
            lifetime_cap_minutes: config
                .lifetime_cap_minutes
                .unwrap_or(defaults.lifetime_cap_minutes),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".lectern").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".lectern");

    let config_file = find_config_file();

    let (home, policy) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        let home = if let Ok(env_home) = std::env::var("LECTERN_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            // home is relative to the .lectern/ directory
            let lectern_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(lectern_dir, home_path)
        } else {
            default_home.clone()
        };

        (home, Policy::from_file(config.policy.as_ref()))
    } else {
        let home = std::env::var("LECTERN_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home.clone());

        (home, Policy::default())
    };

    Ok(ResolvedConfig {
        home,
        config_file,
        policy,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

// ============================================================================
// Convenience functions
// ============================================================================

/// Get the lectern home directory (engine state).
pub fn lectern_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the pending-upload store directory ($LECTERN_HOME/pending)
pub fn pending_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("pending"))
}

/// Get the telemetry journal directory ($LECTERN_HOME/telemetry)
pub fn telemetry_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("telemetry"))
}

/// Get the capture scratch directory ($LECTERN_HOME/captures)
pub fn captures_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("captures"))
}

/// Get the relaunch-route file path ($LECTERN_HOME/relaunch.json)
pub fn relaunch_path() -> Result<PathBuf> {
    Ok(config()?.home.join("relaunch.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_default_policy() {
        let policy = Policy::default();
        assert_eq!(policy.max_upload_bytes, 100 * 1024 * 1024);
        assert_eq!(policy.max_upload_attempts, 3);
        assert_eq!(
            policy.retry_delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(9)
            ]
        );
        assert_eq!(policy.summary_ttl, chrono::Duration::minutes(15));
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let lectern_dir = temp.path().join(".lectern");
        std::fs::create_dir_all(&lectern_dir).unwrap();

        let config_path = lectern_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./
policy:
  max_upload_bytes: 1048576
  retry_delays_secs: [2, 4]
  summary_ttl_minutes: 30
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./".to_string()));

        let policy = Policy::from_file(config.policy.as_ref());
        assert_eq!(policy.max_upload_bytes, 1_048_576);
        assert_eq!(
            policy.retry_delays,
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
        assert_eq!(policy.summary_ttl, chrono::Duration::minutes(30));
        // Unset fields fall back to defaults
        assert_eq!(policy.max_upload_attempts, 3);
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            resolve_path(&base, "../sibling"),
            PathBuf::from("/home/user/project/../sibling")
        );
    }
}
