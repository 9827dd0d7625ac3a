//! HTTP request handlers.

use axum::{
    Json,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Basic};
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::IngestError;
use crate::models::{SegmentType, SegmentUpload};
use crate::storage::is_safe_path_component;
use crate::web::AppState;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp4";

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.statuses().await)
}

/// `POST /upload_segment` — the authenticated segment intake.
pub async fn upload_segment(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Basic>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_started = Instant::now();

    let authorized = auth.as_ref().is_some_and(|TypedHeader(Authorization(creds))| {
        creds.username() == state.config.auth.username
            && creds.password() == state.config.auth.password
    });
    if !authorized {
        return IngestError::Unauthorized.into_response();
    }

    let upload = match parse_upload_headers(&headers) {
        Ok(upload) => upload,
        Err(e) => {
            warn!("rejected upload: {e}");
            return e.into_response();
        }
    };

    if upload.segment_type == SegmentType::Media && upload.duration == 0.0 {
        debug!(
            stream_key = %upload.stream_key,
            sequence = upload.sequence,
            "zero-duration media segment ignored"
        );
        return (StatusCode::OK, "Zero-duration segment ignored.").into_response();
    }

    let session = match state.registry.resolve(&upload).await {
        Ok(session) => session,
        Err(e) => {
            warn!("failed to resolve session: {e}");
            return e.into_response();
        }
    };

    match session.admit(&upload, &body, request_started).await {
        Ok(outcome) => {
            if outcome.finalized {
                state.registry.remove_if_current(&session).await;
            }
            let message = if !outcome.accepted {
                "Segment ignored (session finalized)"
            } else if outcome.stale {
                "Stale segment ignored"
            } else {
                "Segment uploaded"
            };
            (StatusCode::OK, message).into_response()
        }
        Err(e) => {
            warn!(session_id = %session.session_id(), "admit failed: {e}");
            e.into_response()
        }
    }
}

/// `GET /segments/{session_id}/playlist.m3u8` — loopback-only playlist read
/// for the uploader child.
pub async fn serve_playlist(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(session_id): Path<String>,
) -> Response {
    if !addr.ip().is_loopback() {
        return (StatusCode::FORBIDDEN, "Access denied").into_response();
    }
    if !is_safe_path_component(&session_id) {
        return (StatusCode::NOT_FOUND, "Stream not found").into_response();
    }

    let path = state
        .config
        .storage
        .segments_dir
        .join(&session_id)
        .join("playlist.m3u8");
    match tokio::fs::read(&path).await {
        Ok(contents) => (
            [(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)],
            contents,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "Stream not found").into_response(),
    }
}

/// `GET /segments/{session_id}/{filename}` — loopback-only segment read.
pub async fn serve_segment(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((session_id, filename)): Path<(String, String)>,
) -> Response {
    if !addr.ip().is_loopback() {
        return (StatusCode::FORBIDDEN, "Access denied").into_response();
    }
    if !is_safe_path_component(&session_id) || !is_safe_path_component(&filename) {
        return (StatusCode::NOT_FOUND, "Segment not found").into_response();
    }

    let path = state
        .config
        .storage
        .segments_dir
        .join(&session_id)
        .join(&filename);
    match tokio::fs::read(&path).await {
        Ok(contents) => (
            [(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)],
            contents,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "Segment not found").into_response(),
    }
}

const REQUIRED_HEADERS: [&str; 6] = [
    "Target",
    "Stream-Key",
    "Segment-Type",
    "Discontinuity",
    "Duration",
    "Sequence",
];

/// Validate and parse the mandatory upload headers. All missing headers are
/// reported together.
pub fn parse_upload_headers(headers: &HeaderMap) -> Result<SegmentUpload, IngestError> {
    let missing: Vec<&str> = REQUIRED_HEADERS
        .iter()
        .copied()
        .filter(|name| !headers.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        return Err(IngestError::MissingHeaders(missing.join(", ")));
    }

    let value = |name: &'static str| -> Result<&str, IngestError> {
        headers
            .get(name)
            .expect("presence checked above")
            .to_str()
            .map_err(|_| IngestError::InvalidHeader {
                header: name,
                message: "not valid UTF-8".to_string(),
            })
    };

    let target = value("Target")?.to_string();

    // The key becomes a path component of the session directory.
    let stream_key = value("Stream-Key")?.to_string();
    if !is_safe_path_component(&stream_key) {
        return Err(IngestError::InvalidHeader {
            header: "Stream-Key",
            message: "must be usable as a single path component".to_string(),
        });
    }

    let segment_type: SegmentType =
        value("Segment-Type")?
            .parse()
            .map_err(|message| IngestError::InvalidHeader {
                header: "Segment-Type",
                message,
            })?;

    let discontinuity = match value("Discontinuity")? {
        v if v.eq_ignore_ascii_case("true") => true,
        v if v.eq_ignore_ascii_case("false") => false,
        other => {
            return Err(IngestError::InvalidHeader {
                header: "Discontinuity",
                message: format!("expected true or false, got '{other}'"),
            });
        }
    };

    let duration: f64 = value("Duration")?
        .parse()
        .map_err(|e| IngestError::InvalidHeader {
            header: "Duration",
            message: format!("{e}"),
        })?;
    if !duration.is_finite() || duration < 0.0 {
        return Err(IngestError::InvalidHeader {
            header: "Duration",
            message: format!("must be a non-negative number of seconds, got {duration}"),
        });
    }

    let sequence: u64 = value("Sequence")?
        .parse()
        .map_err(|e| IngestError::InvalidHeader {
            header: "Sequence",
            message: format!("{e}"),
        })?;
    if i64::try_from(sequence).is_err() {
        return Err(IngestError::InvalidHeader {
            header: "Sequence",
            message: "sequence number out of range".to_string(),
        });
    }

    Ok(SegmentUpload {
        target,
        stream_key,
        segment_type,
        discontinuity,
        duration,
        sequence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use rstest::rstest;

    fn valid_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Target", HeaderValue::from_static("youtube"));
        headers.insert("Stream-Key", HeaderValue::from_static("abcd-1234"));
        headers.insert("Segment-Type", HeaderValue::from_static("Media"));
        headers.insert("Discontinuity", HeaderValue::from_static("false"));
        headers.insert("Duration", HeaderValue::from_static("2.000000"));
        headers.insert("Sequence", HeaderValue::from_static("11"));
        headers
    }

    #[test]
    fn valid_headers_parse() {
        let upload = parse_upload_headers(&valid_headers()).unwrap();
        assert_eq!(upload.target, "youtube");
        assert_eq!(upload.stream_key, "abcd-1234");
        assert_eq!(upload.segment_type, SegmentType::Media);
        assert!(!upload.discontinuity);
        assert_eq!(upload.duration, 2.0);
        assert_eq!(upload.sequence, 11);
    }

    #[test]
    fn all_missing_headers_are_reported_together() {
        let mut headers = valid_headers();
        headers.remove("Duration");
        headers.remove("Sequence");

        let err = parse_upload_headers(&headers).unwrap_err();
        match err {
            IngestError::MissingHeaders(names) => {
                assert!(names.contains("Duration"));
                assert!(names.contains("Sequence"));
            }
            other => panic!("expected MissingHeaders, got {other:?}"),
        }
    }

    #[rstest]
    #[case("Segment-Type", "media")]
    #[case("Segment-Type", "Init")]
    #[case("Discontinuity", "yes")]
    #[case("Duration", "fast")]
    #[case("Duration", "-1.0")]
    #[case("Duration", "inf")]
    #[case("Sequence", "-3")]
    #[case("Sequence", "1.5")]
    #[case("Stream-Key", "../escape")]
    fn invalid_values_are_rejected(#[case] name: &'static str, #[case] bad: &str) {
        let mut headers = valid_headers();
        headers.insert(name, HeaderValue::from_str(bad).unwrap());
        assert!(parse_upload_headers(&headers).is_err(), "{name}: {bad}");
    }

    #[test]
    fn discontinuity_is_case_insensitive() {
        let mut headers = valid_headers();
        headers.insert("Discontinuity", HeaderValue::from_static("True"));
        assert!(parse_upload_headers(&headers).unwrap().discontinuity);
    }

    #[test]
    fn unknown_target_still_parses() {
        let mut headers = valid_headers();
        headers.insert("Target", HeaderValue::from_static("rumble"));
        // Unknown targets are rejected at uploader start, not at admit time.
        assert_eq!(parse_upload_headers(&headers).unwrap().target, "rumble");
    }
}
