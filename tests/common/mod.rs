//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use tokio::time::Instant;

use hls_relay::config::{AuthConfig, Config, RelayConfig, StorageConfig, WebConfig};
use hls_relay::models::{SegmentType, SegmentUpload};
use hls_relay::registry::StreamRegistry;
use hls_relay::session::{AdmitOutcome, StreamSession};

/// Test configuration rooted in a temp directory. The uploader command is
/// `true` so spawned children exit immediately without touching any network.
pub fn test_config(segments_dir: &Path) -> Config {
    Config {
        web: WebConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        },
        auth: AuthConfig {
            username: "ingest".to_string(),
            password: "secret".to_string(),
        },
        storage: StorageConfig {
            segments_dir: segments_dir.to_path_buf(),
        },
        relay: RelayConfig {
            ffmpeg_command: "true".to_string(),
            ..RelayConfig::default()
        },
    }
}

pub fn upload(
    key: &str,
    segment_type: SegmentType,
    sequence: u64,
    duration: f64,
    discontinuity: bool,
) -> SegmentUpload {
    SegmentUpload {
        target: "youtube".to_string(),
        stream_key: key.to_string(),
        segment_type,
        discontinuity,
        duration,
        sequence,
    }
}

pub fn init(key: &str, sequence: u64) -> SegmentUpload {
    upload(key, SegmentType::Initialization, sequence, 0.0, false)
}

pub fn media(key: &str, sequence: u64, duration: f64) -> SegmentUpload {
    upload(key, SegmentType::Media, sequence, duration, false)
}

/// Drive one upload through the same resolve/admit path the HTTP handler
/// takes.
pub async fn push(registry: &Arc<StreamRegistry>, upload: &SegmentUpload) -> AdmitOutcome {
    let session = registry.resolve(upload).await.expect("resolve session");
    let outcome = session
        .admit(upload, b"test-bytes", Instant::now())
        .await
        .expect("admit");
    if outcome.finalized {
        registry.remove_if_current(&session).await;
    }
    outcome
}

pub async fn read_playlist(session: &StreamSession) -> String {
    tokio::fs::read_to_string(session.playlist_path())
        .await
        .expect("read playlist")
}

/// Builds a `Basic` authorization header value for the given credentials,
/// for tests exercising the HTTP layer directly (axum-test has no
/// `authorization_basic` helper).
pub fn basic_auth_header(username: &str, password: &str) -> String {
    use base64::Engine as _;
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"))
    )
}
