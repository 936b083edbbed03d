//! Log output for programs driving experiments.
//!
//! Run lifecycle events are logged under the `simrun_core` targets, and model
//! stdout that no subscriber consumed under `simrun::model`. Targets are kept
//! in the output so the two can be filtered apart, e.g.
//! `SIMRUN_LOG=info,simrun::model=warn` keeps lifecycle events but only the
//! model's warnings.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter directives, checked before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "SIMRUN_LOG";
/// Set to `json` for newline-delimited JSON output.
pub const LOG_FORMAT_ENV_VAR: &str = "SIMRUN_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Read [`LOG_FORMAT_ENV_VAR`]; anything other than `json` is text.
    pub fn from_env() -> Self {
        Self::parse(std::env::var(LOG_FORMAT_ENV_VAR).ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Install the global subscriber. Later calls in the same process are no-ops.
///
/// `level` applies when neither `SIMRUN_LOG` nor `RUST_LOG` is set.
pub fn init_tracing(format: LogFormat, level: Level) {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
    };
    if installed.is_ok() {
        tracing::debug!(?format, "tracing initialised");
    }
}
