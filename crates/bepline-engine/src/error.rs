//! Error types for bepline-engine.

use bepline_stream::StreamError;
use bepline_util::error::UtilError;

/// Errors produced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Reading or decoding the event stream failed.
    #[error("{0}")]
    Stream(#[from] StreamError),

    /// A utility operation failed.
    #[error("{0}")]
    Util(#[from] UtilError),

    /// A filesystem operation failed.
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// A persisted state file could not be encoded or decoded.
    #[error("invalid tracked state at {path}: {message}")]
    State { path: String, message: String },

    /// A decoded state record refers to targets or artifacts it does not hold.
    #[error("inconsistent tracked state record: {message}")]
    Record { message: String },

    /// A remote artifact could not be fetched.
    #[error("cannot fetch remote artifact {hash_id}: {message}")]
    Fetch { hash_id: String, message: String },
}
