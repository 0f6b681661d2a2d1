//! Error types for the node.

use thiserror::Error;

/// Errors surfaced by store, codec, join and startup operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode mutation batch: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to join cluster via {seeds} seed(s): {reason}")]
    JoinFailed { seeds: usize, reason: String },

    #[error("invalid bind address: {0:?}")]
    InvalidAddress(String),

    #[error("failed to bind transport: {0}")]
    Bind(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
