//! Error type definitions for the HLS relay.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Top-level application error type.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("Uploader error: {0}")]
    Uploader(#[from] UploaderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Ingest(e) => e.into_response(),
            AppError::Storage(e) => e.into_response(),
            AppError::Playlist(e) => e.into_response(),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
        }
    }
}

/// Problems with an upload request, reported synchronously to the caller.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Missing headers: {0}")]
    MissingHeaders(String),

    #[error("Invalid header data: {header}: {message}")]
    InvalidHeader {
        header: &'static str,
        message: String,
    },

    #[error("Could not verify your access level for that URL")]
    Unauthorized,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(
                    header::WWW_AUTHENTICATE,
                    "Basic realm=\"Login Required\"",
                )],
                self.to_string(),
            )
                .into_response(),
            IngestError::MissingHeaders(_) | IngestError::InvalidHeader { .. } => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
        }
    }
}

/// Failures persisting segment bodies or session directories.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Error creating session directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },

    #[error("Error saving segment {filename}: {source}")]
    WriteSegment {
        filename: String,
        source: std::io::Error,
    },
}

impl IntoResponse for StorageError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

/// Failures appending to a session playlist, plus the write-once guards.
#[derive(Error, Debug)]
pub enum PlaylistError {
    #[error("playlist header already written")]
    HeaderAlreadyWritten,

    #[error("ENDLIST already written")]
    EndlistAlreadyWritten,

    #[error("playlist write failed: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for PlaylistError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

/// Failures starting or supervising the uploader child process.
#[derive(Error, Debug)]
pub enum UploaderError {
    #[error("Unsupported target: {0}")]
    UnsupportedTarget(String),

    #[error("Failed to spawn uploader: {0}")]
    Spawn(#[from] std::io::Error),
}
