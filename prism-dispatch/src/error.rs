//! Dispatch-specific error types

use thiserror::Error;

/// Errors that can escape the dispatch core.
///
/// Per-node and per-group problems never show up here; they are absorbed into
/// liveness and coverage flags. Only configuration and topology problems do.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            DispatchError::Config(_) => "config",
            DispatchError::InvalidTopology(_) => "invalid_topology",
            DispatchError::Io(_) => "io",
        }
    }
}

impl From<toml::de::Error> for DispatchError {
    fn from(err: toml::de::Error) -> Self {
        DispatchError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
