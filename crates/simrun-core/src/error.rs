//! Error taxonomy for experiment runs.

use simrun_config::ConfigError;

/// Errors produced while preparing, executing or archiving a run.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Required environment roots or profile are missing. Not recoverable.
    #[error("environment not configured: {0}")]
    Env(String),

    /// Filesystem failure, wrapped with what was being done.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A required input (restart archive, diagnostics output, env file) is missing.
    #[error("input/output error: {0}")]
    InpOut(String),

    /// The model process exited unsuccessfully.
    #[error("run {run} failed: {reason}")]
    RunFailed { run: u32, reason: String },

    #[error("invalid argument: {0}")]
    Argument(String),

    /// Irreversible operation attempted on an experiment flagged safe.
    #[error("cannot run destructive operation `{operation}` in safe mode")]
    SafeMode { operation: &'static str },

    /// The run was interrupted; the model process has been stopped.
    #[error("run {run} cancelled")]
    Cancelled { run: u32 },

    /// An event subscriber returned an error.
    #[error("subscriber for {event} failed: {source}")]
    Hook {
        event: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SimError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SimError::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error belongs to the I/O category (OS failures and
    /// missing inputs alike).
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            SimError::Io { .. } | SimError::InpOut(_) | SimError::Config(ConfigError::Io { .. })
        )
    }
}

/// Result type for simrun operations.
pub type Result<T> = std::result::Result<T, SimError>;
