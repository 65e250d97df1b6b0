//! Error types for the core library.

use thiserror::Error;

use crate::config::ValidationError;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IMAP operation failed.
    #[error("IMAP error: {0}")]
    Imap(#[from] mailpulse_imap::Error),

    /// SMTP operation failed.
    #[error("SMTP error: {0}")]
    Smtp(#[from] mailpulse_smtp::Error),

    /// The outgoing message could not be composed.
    #[error("Message error: {0}")]
    Mime(#[from] mailpulse_mime::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings failed validation.
    #[error("Invalid configuration: {}", join(.0))]
    Invalid(Vec<ValidationError>),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns true if this error only reports cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ValidationError::message)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_distinguished() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Config("x".into()).is_cancelled());
    }

    #[test]
    fn validation_messages_are_joined() {
        let err = Error::Invalid(vec![ValidationError::EmptyImapHost, ValidationError::EmptySmtpHost]);
        assert_eq!(
            err.to_string(),
            "Invalid configuration: IMAP server is required; SMTP server is required"
        );
    }
}
