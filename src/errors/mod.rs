//! Centralized error handling for the HLS relay.
//!
//! Errors are split by layer: ingest-request problems map onto HTTP status
//! codes at the web boundary, storage and playlist failures surface as
//! 500-class responses, and uploader failures never fail an admit at all —
//! they are recorded in the session event history instead.

pub mod types;

pub use types::*;

/// Convenience alias for results using the top-level error.
pub type AppResult<T> = Result<T, AppError>;
