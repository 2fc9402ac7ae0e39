use thiserror::Error;

use crate::domain::Layer;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("JSON (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("{layer} layer input '{name}' is missing")]
    MissingInput { layer: Layer, name: String },

    #[error("{layer} layer input '{name}' is corrupt: {reason}")]
    CorruptInput {
        layer: Layer,
        name: String,
        reason: String,
    },

    #[error("illegal layer transition {from} -> {to}")]
    IllegalTransition { from: Layer, to: Layer },

    #[error("stage {stage} failed: {reason}")]
    Stage { stage: Layer, reason: String },

    #[error("run cancelled before {stage}")]
    Cancelled { stage: Layer },

    #[error("another pipeline run holds the lock at {path} ({holder})")]
    RunLocked { path: String, holder: String },
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Database {
            message: err.to_string(),
        }
    }
}

/// Failures reported by a byte-oriented storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend error: {message}")]
    Backend { message: String },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
