//! Error types shared by the orch crates.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading the service config or the mapping feed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid mapping {id}: {message}")]
    Mapping { id: String, message: String },
}

/// A rejected piece of client or feed input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {message}")]
pub struct InvalidInput {
    pub field: &'static str,
    pub value: String,
    pub message: String,
}

impl InvalidInput {
    pub fn new(field: &'static str, value: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
            message: message.into(),
        }
    }
}
