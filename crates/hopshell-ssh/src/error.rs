//! Transport-level error types

use thiserror::Error;
use std::io;

/// Errors raised by shells, tunnels and the connectors that create them
#[derive(Debug, Error)]
pub enum TransportError {
    /// Generic connection error
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// A connection to `target` could not be established
    #[error("failed to connect to {target}: {source}")]
    Connect {
        /// Login the connection was attempted for
        target: String,
        /// Underlying failure
        #[source]
        source: Box<TransportError>,
    },

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Remote command failed
    #[error("Remote command failed with exit code {code}: {message}")]
    CommandFailed {
        /// Exit code of the failed command
        code: i32,
        /// Error message
        message: String,
    },

    /// The shell or resource was already closed
    #[error("{0} is closed")]
    Closed(String),

    /// A login specifier could not be parsed
    #[error("invalid login '{0}'")]
    InvalidLogin(String),
}

impl TransportError {
    /// Wrap an error as a connection failure for `target`
    pub fn connect(target: impl ToString, source: TransportError) -> Self {
        Self::Connect {
            target: target.to_string(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_connect_error_carries_target() {
        let err = TransportError::connect("alice@db1:5432", TransportError::Timeout);
        let text = err.to_string();
        assert!(text.contains("alice@db1:5432"));
        assert!(text.contains("timed out"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_command_failed_display() {
        let err = TransportError::CommandFailed { code: 2, message: "no such file".to_string() };
        assert_eq!(err.to_string(), "Remote command failed with exit code 2: no such file");
    }
}
