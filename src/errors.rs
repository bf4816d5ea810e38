use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code}: {stderr_tail}")]
    ProcessExit {
        program: String,
        code: i32,
        stderr_tail: String,
    },

    #[error("Stdio pipe to {program} failed: {source}")]
    Pipe {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Compression stream error: {0}")]
    Compression(#[source] std::io::Error),

    #[error("Storage transfer failed: {0}")]
    Transfer(String),

    #[error("Operation exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("Database '{name}' still missing after creation attempt")]
    DatabaseCreation { name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
