use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod defaults;
pub mod duration_serde;

use defaults::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Basic-auth credentials for the ingest endpoint. Deliberately without
/// defaults: the service refuses to start unless an operator sets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory under which every session gets its own subdirectory.
    #[serde(default = "default_segments_dir")]
    pub segments_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            segments_dir: default_segments_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Command used to launch the uploader child process.
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg_command: String,

    /// Number of media segments that must be in the playlist before the
    /// uploader is started for the first time.
    #[serde(default = "default_segments_before_relay")]
    pub segments_before_relay: u64,

    /// A session with neither uploads nor playlist progress for this long is
    /// finalized by its stall watcher.
    #[serde(
        with = "duration_serde::duration",
        default = "default_missing_segment_timeout"
    )]
    pub missing_segment_timeout: Duration,

    /// How long the playlist writer waits on a missing sequence number
    /// before skipping ahead to the next buffered segment.
    #[serde(with = "duration_serde::duration", default = "default_gap_skip_timeout")]
    pub gap_skip_timeout: Duration,

    /// Sliding window over which upload wall-times are aggregated for the
    /// utilization figure on the status endpoint.
    #[serde(
        with = "duration_serde::duration",
        default = "default_upload_util_window"
    )]
    pub upload_util_window: Duration,

    /// Bounded per-session event history exposed on the status endpoint.
    #[serde(default = "default_max_event_history")]
    pub max_event_history: usize,

    /// What to do when an admit carries a different `Target` while an
    /// uploader is already running.
    #[serde(default)]
    pub on_target_change: TargetMismatchPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ffmpeg_command: default_ffmpeg_command(),
            segments_before_relay: default_segments_before_relay(),
            missing_segment_timeout: default_missing_segment_timeout(),
            gap_skip_timeout: default_gap_skip_timeout(),
            upload_util_window: default_upload_util_window(),
            max_event_history: default_max_event_history(),
            on_target_change: TargetMismatchPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetMismatchPolicy {
    /// Keep the running uploader and record the mismatch as a session event.
    #[default]
    Reject,
    /// Terminate the running uploader and restart it at the live edge with
    /// the newly presented target.
    Restart,
}

impl Config {
    /// Load configuration from a TOML file, layered with `HLS_RELAY_*`
    /// environment overrides (e.g. `HLS_RELAY_WEB__PORT=9000`).
    pub fn load_from_file(path: &str) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("HLS_RELAY_").split("__"))
            .extract()
            .with_context(|| format!("failed to load configuration from {path}"))?;
        Ok(config)
    }
}
