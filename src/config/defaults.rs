/// Configuration default values
///
/// All defaults live here so they are changeable in one central location.
use std::time::Duration;

// Web server defaults
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

// Storage defaults
pub const DEFAULT_SEGMENTS_DIR: &str = "./data/segments";

// Relay defaults
pub const DEFAULT_FFMPEG_COMMAND: &str = "ffmpeg";
pub const DEFAULT_SEGMENTS_BEFORE_RELAY: u64 = 3;
pub const DEFAULT_MISSING_SEGMENT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_GAP_SKIP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_UPLOAD_UTIL_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_EVENT_HISTORY: usize = 20;

pub fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

pub fn default_port() -> u16 {
    DEFAULT_PORT
}

pub fn default_segments_dir() -> std::path::PathBuf {
    DEFAULT_SEGMENTS_DIR.into()
}

pub fn default_ffmpeg_command() -> String {
    DEFAULT_FFMPEG_COMMAND.to_string()
}

pub fn default_segments_before_relay() -> u64 {
    DEFAULT_SEGMENTS_BEFORE_RELAY
}

pub fn default_missing_segment_timeout() -> Duration {
    DEFAULT_MISSING_SEGMENT_TIMEOUT
}

pub fn default_gap_skip_timeout() -> Duration {
    DEFAULT_GAP_SKIP_TIMEOUT
}

pub fn default_upload_util_window() -> Duration {
    DEFAULT_UPLOAD_UTIL_WINDOW
}

pub fn default_max_event_history() -> usize {
    DEFAULT_MAX_EVENT_HISTORY
}
