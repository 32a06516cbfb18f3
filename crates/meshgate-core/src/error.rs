//! Error types shared across meshgate crates.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for core type construction.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while constructing core domain values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("service name must not be empty")]
    EmptyServiceName,

    #[error("instance {endpoint} belongs to service {found}, not {expected}")]
    ForeignInstance {
        endpoint: String,
        expected: String,
        found: String,
    },

    #[error("instance host must not be empty")]
    EmptyHost,
}

/// Errors raised while loading or compiling gateway configuration.
///
/// Any of these rejects the whole document; nothing is partially applied.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("route {id}: {reason}")]
    InvalidRoute { id: String, reason: String },

    #[error("duplicate route id: {0}")]
    DuplicateRoute(String),

    #[error("service {name}: {reason}")]
    InvalidService { name: String, reason: String },

    #[error("invalid policy in {scope}: {reason}")]
    InvalidPolicy { scope: String, reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),
}
