//! Error types for the hopshell core

use hopshell_ssh::TransportError;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for pool, shore and tunnel operations
#[derive(Debug, Error)]
pub enum ShoreError {
    /// Transport-related errors
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// One hop of a multi-hop route failed
    #[error("hop {index} ({hop}) could not forward to {target}: {source}")]
    Hop {
        /// Position of the failing hop in the route, outermost first
        index: usize,
        /// Login of the hop that failed
        hop: String,
        /// `host:port` the hop was asked to forward to
        target: String,
        /// Underlying failure
        #[source]
        source: Box<ShoreError>,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration parse errors
    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A failure delivered to every caller that waited on the same resolution
    #[error(transparent)]
    Shared(Arc<ShoreError>),
}

impl ShoreError {
    /// Strip [`ShoreError::Shared`] wrappers
    pub fn root(&self) -> &ShoreError {
        match self {
            Self::Shared(inner) => inner.root(),
            other => other,
        }
    }
}
