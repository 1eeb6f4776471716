//! Error type shared by every stage of a join run.
//!
//! Only setup can fail: configuration, schema parsing, file loading and the
//! join-column checks done when an engine is initialised. Once build or
//! probe starts the hot loops are infallible.

use thiserror::Error;

use crate::schema::ColumnType;

/// Result type alias using [`JoinError`].
pub type Result<T> = std::result::Result<T, JoinError>;

/// Which input a join column belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Build,
    Probe,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Build => f.write_str("build"),
            Side::Probe => f.write_str("probe"),
        }
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid schema: {0}")]
    Schema(String),

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("{side} join column {column} has type {found:?}, expected INTEGER or LONG")]
    JoinColumnType {
        side: Side,
        column: usize,
        found: ColumnType,
    },

    #[error("cached hash table references a different build table")]
    BuildSideMismatch,

    #[error("not implemented: {0}")]
    NotImplemented(String),
}
