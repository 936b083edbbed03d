//! Structured lifecycle events for experiment runs.
//!
//! Every run executes inside a span carrying `experiment` and `run`, so the
//! helpers below only add the event-specific fields. Events are logged at
//! `info!` with an `event = "run.*"` field for filtering.

use tracing::{debug, info, warn, Span};

use crate::experiment::RunState;

/// Span wrapping all work for one run. Attach with
/// [`tracing::Instrument::instrument`] so it survives `.await` points.
pub fn run_span(experiment: &str, run: u32) -> Span {
    tracing::info_span!("simrun.run", experiment = %experiment, run = run)
}

pub fn emit_run_started(experiment: &str, run: u32, num_cores: u32) {
    info!(event = "run.started", experiment = %experiment, run = run, num_cores = num_cores);
}

pub fn emit_state_changed(run: u32, from: RunState, to: RunState) {
    debug!(event = "run.state", run = run, from = ?from, to = ?to);
}

/// Run skipped because its output already exists.
pub fn emit_run_skipped(experiment: &str, run: u32, output_dir: &std::path::Path) {
    warn!(
        event = "run.skipped",
        experiment = %experiment,
        run = run,
        output_dir = %output_dir.display(),
        "output already exists, skipping run"
    );
}

pub fn emit_run_finished(experiment: &str, run: u32, duration_ms: u64, state: RunState) {
    info!(
        event = "run.finished",
        experiment = %experiment,
        run = run,
        duration_ms = duration_ms,
        state = ?state,
    );
}

/// Relay one line of model output nobody subscribed to.
///
/// Lines mentioning a warning are surfaced at `warn!`, the rest at `debug!`.
pub fn log_model_output(line: &str) {
    if line.to_ascii_lowercase().contains("warning") {
        warn!(target: "simrun::model", "{}", line);
    } else {
        debug!(target: "simrun::model", "{}", line);
    }
}
