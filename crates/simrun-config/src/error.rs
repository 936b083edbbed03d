//! Error types for simrun-config

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building or (de)serializing experiment configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A diagnostics field targeted an output file that was never declared.
    #[error("unknown diagnostics output file: {0}")]
    UnknownFile(String),

    /// A diag table record could not be interpreted.
    #[error("invalid diag table record on line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },

    /// No built-in resolution preset with this name.
    #[error("unknown resolution preset: {0}")]
    UnknownResolution(String),

    /// Filesystem failure, with the operation and path that caused it.
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;
