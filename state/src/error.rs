use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to initialize storage at {path}: {message}")]
    Init { path: PathBuf, message: String },

    #[error("storage write failed: {0}")]
    Write(#[source] sqlx::Error),

    #[error("storage query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("failed to encode stored value: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl StateError {
    pub(crate) fn init(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Init {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
