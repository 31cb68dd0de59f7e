use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("task queue unavailable: {0}")]
    BackendUnavailable(String),

    #[error("job state kept changing underneath us ({attempts} attempts)")]
    StateConflict { attempts: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("failed to encode {path}: {reason}")]
    Encode { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;
