use std::fmt::Display;

use crate::config::JournalId;

/// A specialized error type for journal operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A journal file header or record could not be parsed.
    #[error("format error: {0}")]
    Format(String),
    /// A journal required for recovery is missing.
    #[error("recovery journal {0} is missing")]
    MissingJournal(JournalId),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The journal is shutting down and cannot accept the operation.
    #[error("journal is shutting down")]
    ShutdownRequested,
    /// A pipeline stage exited while a peer was still handing it work.
    #[error("interrupted: {0}")]
    Interrupted(String),
}

impl JournalError {
    /// Create a format error from a displayable value.
    pub fn format<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Format(msg.to_string())
    }

    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }

    /// Create an interrupted error from a displayable value.
    pub fn interrupted<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Interrupted(msg.to_string())
    }
}

/// A Result type alias for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_helper() {
        let err = JournalError::invalid_config("bad alignment");
        assert!(matches!(err, JournalError::InvalidConfig(msg) if msg == "bad alignment"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = JournalError::from(io);
        assert!(matches!(err, JournalError::Io(_)));
    }
}
