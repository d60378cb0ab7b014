use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MartError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("sequence retrieval failed: {0}")]
    Sequence(String),

    #[error("unsupported format: {0}")]
    Format(String),

    #[error(
        "entity key {key} has more than {limit} rows; the per-key batch ceiling was exceeded"
    )]
    #[diagnostic(help("narrow the query with filters; entities this large cannot be paged by key"))]
    KeyBatchOverflow { key: i64, limit: usize },

    #[error("missing config file mart.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid sequence store spec: {0}")]
    InvalidChunkSpec(String),

    #[error("id list request failed: {0}")]
    IdListHttp(String),

    #[error("id list source returned status {status}: {message}")]
    IdListStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
