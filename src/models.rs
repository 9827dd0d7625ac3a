//! Domain types shared across the ingest, session, and web layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classification of an uploaded segment, from the `Segment-Type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    Initialization,
    Media,
    Finalization,
}

impl FromStr for SegmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Initialization" => Ok(SegmentType::Initialization),
            "Media" => Ok(SegmentType::Media),
            "Finalization" => Ok(SegmentType::Finalization),
            other => Err(format!("unknown segment type '{other}'")),
        }
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SegmentType::Initialization => "Initialization",
            SegmentType::Media => "Media",
            SegmentType::Finalization => "Finalization",
        };
        f.write_str(s)
    }
}

/// Ingest destination for the uploader child process.
///
/// The `Target` header stays an opaque string until an uploader actually has
/// to start; unknown values are rejected at that point, not at admit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayTarget {
    Youtube,
    Twitch,
}

impl FromStr for RelayTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "youtube" => Ok(RelayTarget::Youtube),
            "twitch" => Ok(RelayTarget::Twitch),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayTarget::Youtube => "youtube",
            RelayTarget::Twitch => "twitch",
        };
        f.write_str(s)
    }
}

/// Parsed metadata of one upload request.
#[derive(Debug, Clone)]
pub struct SegmentUpload {
    pub target: String,
    pub stream_key: String,
    pub segment_type: SegmentType,
    pub discontinuity: bool,
    pub duration: f64,
    pub sequence: u64,
}

/// A segment waiting in the pending queue for the write cursor to reach it.
#[derive(Debug, Clone)]
pub struct PendingSegment {
    pub filename: String,
    pub duration: f64,
    pub discontinuity: bool,
}

/// One entry in the bounded per-session event history.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl SessionEvent {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

/// Snapshot of the uploader child for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UploaderStatus {
    pub running: bool,
    pub target: Option<RelayTarget>,
    /// Last observed exit, e.g. "exit code 1" or "signal 9".
    pub last_exit: Option<String>,
}

/// Snapshot of one session for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub stream_key: String,
    pub session_id: String,
    pub period_index: u32,
    pub last_written_sequence: i64,
    pub written_media_count: u64,
    pub gap_wait_sequence: Option<u64>,
    pub finalized: bool,
    pub uploader: UploaderStatus,
    /// Share of the sliding window spent inside upload requests, 0.0..=1.0+.
    pub upload_utilization: f64,
    pub events: Vec<SessionEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_type_parses_exact_header_values() {
        assert_eq!(
            "Initialization".parse::<SegmentType>().unwrap(),
            SegmentType::Initialization
        );
        assert_eq!("Media".parse::<SegmentType>().unwrap(), SegmentType::Media);
        assert_eq!(
            "Finalization".parse::<SegmentType>().unwrap(),
            SegmentType::Finalization
        );
        assert!("media".parse::<SegmentType>().is_err());
        assert!("init".parse::<SegmentType>().is_err());
    }

    #[test]
    fn relay_target_round_trips() {
        assert_eq!("youtube".parse::<RelayTarget>().unwrap(), RelayTarget::Youtube);
        assert_eq!("twitch".parse::<RelayTarget>().unwrap(), RelayTarget::Twitch);
        assert_eq!(RelayTarget::Youtube.to_string(), "youtube");
        assert_eq!(RelayTarget::Twitch.to_string(), "twitch");
        assert_eq!("rumble".parse::<RelayTarget>().unwrap_err(), "rumble");
    }
}
