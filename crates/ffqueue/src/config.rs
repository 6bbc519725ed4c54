use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Phrase ffmpeg prints when a stream is corrupt beyond recovery
pub const DEFAULT_ERROR_MARKER: &str = "Error while decoding stream";

/// Configuration for the job queue and its process runner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// File the unfinished jobs are written to on shutdown
    pub state_file: PathBuf,
    /// Shell used to execute job command lines (invoked as `<shell> -c <command>`)
    pub shell: PathBuf,
    /// Path to the ffprobe binary used for duration probing
    pub ffprobe_bin: PathBuf,
    /// Phrases in the diagnostic stream that mark a run as failed
    pub error_markers: Vec<String>,
    /// Size of a single pipe read in bytes
    pub read_buffer_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl QueueConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            state_file: default_state_file(),
            shell: PathBuf::from("/bin/sh"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            error_markers: vec![DEFAULT_ERROR_MARKER.to_string()],
            read_buffer_size: 4096,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        if config.read_buffer_size == 0 {
            config.read_buffer_size = 4096;
        }

        Ok(config)
    }
}

/// `$XDG_CONFIG_HOME/ffqueue/jobs.json`, falling back to `~/.config` and then `/tmp`
fn default_state_file() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME")
                .filter(|v| !v.is_empty())
                .map(|home| PathBuf::from(home).join(".config"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"));

    base.join("ffqueue").join("jobs.json")
}
