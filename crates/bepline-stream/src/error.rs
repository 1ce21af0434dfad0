//! Error types for bepline-stream.

/// A failure that aborts the parse of one event stream.
///
/// Never retried internally; a retry is a fresh parse over a fresh stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The stream file could not be opened.
    #[error("cannot open event stream {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    /// The underlying reader failed.
    #[error("cannot read event stream at byte {offset}: {source}")]
    Io {
        offset: u64,
        source: std::io::Error,
    },

    /// The stream ended inside a length prefix or message body.
    #[error("event stream truncated at byte {offset}")]
    Truncated { offset: u64 },

    /// A length prefix is not a valid varint.
    #[error("invalid length prefix at byte {offset}")]
    BadLengthPrefix { offset: u64 },

    /// A single message exceeds the configured size limit.
    #[error("message at byte {offset} is {len} bytes, larger than the {max}-byte limit")]
    FrameTooLarge { offset: u64, len: u64, max: u64 },

    /// A message body could not be decoded.
    #[error("malformed build event #{index}: {source}")]
    Malformed {
        index: u64,
        source: serde_json::Error,
    },

    /// A file set id is referenced but never defined in the stream.
    #[error("named file set \"{id}\" referenced by {referenced_by} is not defined in the stream")]
    UnresolvedFileSet { id: String, referenced_by: String },

    /// A message could not be encoded.
    #[error("cannot encode build event: {source}")]
    Encode { source: serde_json::Error },
}
