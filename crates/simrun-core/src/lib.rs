//! simrun-core: run-lifecycle orchestration for numerical model experiments
//!
//! Drives one model run at a time through staging, restart restoration,
//! subprocess execution, output consolidation and restart archiving. Run
//! configuration comes from [`simrun_config`].
//!
//! ```ignore
//! let env = SimEnv::from_env()?;
//! let codebase = Arc::new(GitCodebase::new("dry", src, build, "dry.x"));
//! let mut exp = Experiment::new("held_suarez", codebase, &env)?;
//! exp.diag_table.add_file("daily", 1, "days", None);
//! exp.diag_table.add_field("dynamics", "temp", false, None)?;
//! exp.run(1, &RunOptions::new().num_cores(16)).await?;
//! ```

pub mod archive;
pub mod codebase;
pub mod combine;
pub mod env;
pub mod error;
pub mod events;
pub mod experiment;
pub mod fsutil;
pub mod obs;
pub mod script;
pub mod telemetry;

pub use archive::RestartArchiver;
pub use codebase::{Codebase, GitCodebase};
pub use combine::OutputCombiner;
pub use env::SimEnv;
pub use error::{Result, SimError};
pub use events::{EventBus, EventKind, Handler, RunEvent};
pub use experiment::{Experiment, RunOptions, RunOutcome, RunRecord, RunState};
pub use script::{RunScript, ScriptProcess};
pub use telemetry::{init_tracing, LogFormat};

pub use simrun_config;
