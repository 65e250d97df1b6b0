//! Error types for MIME operations.

/// Result type alias for MIME operations.
pub type Result<T> = std::result::Result<T, Error>;

/// MIME error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed transfer or header encoding.
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    /// Multipart body without a usable boundary.
    #[error("Missing boundary in multipart message")]
    MissingBoundary,

    /// Multipart nesting deeper than supported.
    #[error("Multipart nesting exceeds {0} levels")]
    TooDeep(usize),

    /// Header value that cannot be placed in a message.
    #[error("Invalid header value for {name}: {reason}")]
    InvalidHeader {
        /// Header name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
