//! Experiments and the run lifecycle.
//!
//! An [`Experiment`] owns the configuration for a sequence of runs and the
//! directories they use:
//!
//! ```text
//! $GFDL_WORK/experiment/<name>/run/     staging, recreated for every run
//! $GFDL_DATA/<name>/run0001/            output of run 1
//! $GFDL_DATA/<name>/restarts/res0001.tar.gz
//! ```
//!
//! [`Experiment::run`] drives one run through
//! `Idle -> Preparing -> Restoring -> Executing -> Combining -> Archiving ->
//! Finalizing -> Complete`, leaving it `Failed` or `Cancelled` on error.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use simrun_config::{DiagTable, Namelist, Resolution, Section, SPECTRAL_SECTION};
use tracing::{debug, error, info, warn, Instrument};

use crate::archive::RestartArchiver;
use crate::codebase::Codebase;
use crate::combine::OutputCombiner;
use crate::env::SimEnv;
use crate::error::{Result, SimError};
use crate::events::{EventBus, EventKind, Handler, RunEvent};
use crate::fsutil;
use crate::obs;
use crate::script::{RunScript, ScriptProcess};

/// Source revision record written next to every run.
pub const STATUS_FILE: &str = "git_hash_used.txt";
pub const NAMELIST_FILE: &str = "input.nml";
pub const DIAG_TABLE_FILE: &str = "diag_table";
pub const FIELD_TABLE_FILE: &str = "field_table";
const RUN_SCRIPT_FILE: &str = "run.sh";
const MULTI_NODE_OPTS: &str = " -bootstrap pbsdsh -f $PBS_NODEFILE";

/// Per-run knobs for [`Experiment::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Archive to restore from instead of the previous run's.
    pub restart_file: Option<PathBuf>,
    pub use_restart: bool,
    /// Launch across PBS nodes.
    pub multi_node: bool,
    pub num_cores: u32,
    /// Replace existing output for the run instead of skipping it.
    pub overwrite_data: bool,
    /// Copy the whole staging directory into the output directory.
    pub save_run: bool,
    pub run_debugger: bool,
    pub nice_score: i32,
    pub launcher: Option<String>,
    pub launcher_opts: String,
    pub archive_restart: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            restart_file: None,
            use_restart: true,
            multi_node: false,
            num_cores: 8,
            overwrite_data: false,
            save_run: false,
            run_debugger: false,
            nice_score: 0,
            launcher: Some("mpirun".to_string()),
            launcher_opts: String::new(),
            archive_restart: true,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restart_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.restart_file = Some(path.into());
        self
    }

    pub fn use_restart(mut self, yes: bool) -> Self {
        self.use_restart = yes;
        self
    }

    pub fn multi_node(mut self, yes: bool) -> Self {
        self.multi_node = yes;
        self
    }

    pub fn num_cores(mut self, n: u32) -> Self {
        self.num_cores = n;
        self
    }

    pub fn overwrite_data(mut self, yes: bool) -> Self {
        self.overwrite_data = yes;
        self
    }

    pub fn save_run(mut self, yes: bool) -> Self {
        self.save_run = yes;
        self
    }

    pub fn run_debugger(mut self, yes: bool) -> Self {
        self.run_debugger = yes;
        self
    }

    pub fn nice_score(mut self, score: i32) -> Self {
        self.nice_score = score;
        self
    }

    /// Process launcher; `None` runs the executable directly.
    pub fn launcher(mut self, launcher: Option<&str>) -> Self {
        self.launcher = launcher.map(str::to_string);
        self
    }

    pub fn launcher_opts(mut self, opts: impl Into<String>) -> Self {
        self.launcher_opts = opts.into();
        self
    }

    pub fn archive_restart(mut self, yes: bool) -> Self {
        self.archive_restart = yes;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Preparing,
    Restoring,
    Executing,
    Combining,
    Archiving,
    Finalizing,
    Complete,
    Failed,
    Cancelled,
    /// Output for the run already existed; nothing was touched.
    Skipped,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Complete | RunState::Failed | RunState::Cancelled | RunState::Skipped
        )
    }
}

/// Working state of one [`Experiment::run`] call.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run: u32,
    pub state: RunState,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub restart_dir: PathBuf,
    pub restart_source: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
}

impl RunRecord {
    fn new(run: u32, rundir: &Path, output_dir: PathBuf) -> Self {
        Self {
            run,
            state: RunState::Idle,
            input_dir: rundir.join("INPUT"),
            output_dir,
            restart_dir: rundir.join("RESTART"),
            restart_source: None,
            started_at: Utc::now(),
            finished_at: None,
            success: false,
        }
    }

    fn transition(&mut self, to: RunState) {
        if self.state != to {
            obs::emit_state_changed(self.run, self.state, to);
            self.state = to;
        }
    }
}

/// Result of a run that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        run: u32,
        output_dir: PathBuf,
        restart_archive: Option<PathBuf>,
    },
    /// Output already existed and overwriting was not requested.
    Skipped { run: u32, output_dir: PathBuf },
}

impl RunOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, RunOutcome::Skipped { .. })
    }

    pub fn output_dir(&self) -> &Path {
        match self {
            RunOutcome::Completed { output_dir, .. } | RunOutcome::Skipped { output_dir, .. } => {
                output_dir
            }
        }
    }
}

enum Step {
    Line(Result<Option<String>>),
    Cancel,
}

pub struct Experiment {
    name: String,
    codebase: Arc<dyn Codebase>,
    env: SimEnv,
    env_source: PathBuf,
    safe_mode: bool,
    workdir: PathBuf,
    rundir: PathBuf,
    datadir: PathBuf,
    restartdir: PathBuf,
    pub namelist: Namelist,
    pub diag_table: DiagTable,
    input_files: Vec<PathBuf>,
    events: EventBus,
    last_run: Option<RunRecord>,
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("name", &self.name)
            .field("codebase", &self.codebase.name())
            .field("safe_mode", &self.safe_mode)
            .field("workdir", &self.workdir)
            .field("datadir", &self.datadir)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Experiment {
    /// Create an experiment under the roots in `env`.
    ///
    /// Fails if the environment setup file for the profile is missing.
    pub fn new(name: &str, codebase: Arc<dyn Codebase>, env: &SimEnv) -> Result<Self> {
        validate_name(name)?;
        let env_source = env.resolve_env_file()?;

        let workdir = env.work_dir().join("experiment").join(name);
        let rundir = workdir.join("run");
        let datadir = env.data_dir().join(name);
        let restartdir = datadir.join("restarts");

        Ok(Self {
            name: name.to_string(),
            codebase,
            env: env.clone(),
            env_source,
            safe_mode: false,
            workdir,
            rundir,
            datadir,
            restartdir,
            namelist: Namelist::new(),
            diag_table: DiagTable::new(),
            input_files: Vec::new(),
            events: EventBus::new(),
            last_run: None,
        })
    }

    /// Reject every operation that deletes data.
    pub fn with_safe_mode(mut self, safe: bool) -> Self {
        self.safe_mode = safe;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codebase(&self) -> &Arc<dyn Codebase> {
        &self.codebase
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode
    }

    pub fn env_source(&self) -> &Path {
        &self.env_source
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn rundir(&self) -> &Path {
        &self.rundir
    }

    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    pub fn restartdir(&self) -> &Path {
        &self.restartdir
    }

    pub fn input_files(&self) -> &[PathBuf] {
        &self.input_files
    }

    /// Record of the most recent run attempt.
    pub fn last_run(&self) -> Option<&RunRecord> {
        self.last_run.as_ref()
    }

    pub fn restart_file(&self, run: u32) -> PathBuf {
        self.restartdir.join(format!("res{run:04}.tar.gz"))
    }

    pub fn output_dir(&self, run: u32) -> PathBuf {
        self.datadir.join(format!("run{run:04}"))
    }

    pub fn has_output(&self, run: u32) -> bool {
        self.output_dir(run).is_dir()
    }

    // ---- configuration ----

    /// Merge sections into the namelist, overwriting existing keys.
    pub fn update_namelist<I, S>(&mut self, updates: I)
    where
        I: IntoIterator<Item = (S, Section)>,
        S: Into<String>,
    {
        self.namelist.update(updates);
    }

    /// Apply a spectral truncation preset such as `"T42"`.
    pub fn set_resolution(&mut self, preset: &str, num_levels: Option<i64>) -> Result<()> {
        let res = Resolution::preset(preset).map_err(|e| SimError::Argument(e.to_string()))?;
        self.namelist
            .update([(SPECTRAL_SECTION, res.to_section(num_levels))]);
        Ok(())
    }

    /// Extra file copied into `INPUT/` before every run.
    pub fn add_input_file(&mut self, path: impl Into<PathBuf>) {
        self.input_files.push(path.into());
    }

    /// Subscribe to a lifecycle event.
    pub fn on<F>(&mut self, kind: EventKind, callback: F) -> Handler
    where
        F: Fn(&str, &RunEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.on(kind, callback)
    }

    /// `main_nml.calendar`, if set.
    pub fn calendar(&self) -> Option<String> {
        self.namelist
            .get("main_nml", "calendar")
            .map(|v| v.to_string())
    }

    /// New experiment with this one's configuration and inputs.
    ///
    /// Subscribers and safe mode are not carried over.
    pub fn derive(&self, name: &str) -> Result<Experiment> {
        let mut exp = Experiment::new(name, Arc::clone(&self.codebase), &self.env)?;
        exp.namelist = self.namelist.clone();
        exp.diag_table = self.diag_table.clone();
        exp.input_files = self.input_files.clone();
        Ok(exp)
    }

    pub fn write_namelist(&self, dir: &Path) -> Result<()> {
        let path = dir.join(NAMELIST_FILE);
        info!("Writing namelist to {}", path.display());
        self.namelist.write(&path)?;
        Ok(())
    }

    pub fn write_field_table(&self, dir: &Path) -> Result<()> {
        let src = self.codebase.field_table();
        let dest = dir.join(FIELD_TABLE_FILE);
        info!("Writing field_table to {}", dest.display());
        std::fs::copy(&src, &dest).map_err(|e| {
            SimError::io(
                format!("copy field table {} to {}", src.display(), dest.display()),
                e,
            )
        })?;
        Ok(())
    }

    /// Write the diag table, taking the calendar from the namelist if the
    /// table has none yet.
    pub fn write_diag_table(&mut self, dir: &Path) -> Result<()> {
        let path = dir.join(DIAG_TABLE_FILE);
        info!("Writing diag_table to {}", path.display());
        if !self.diag_table.is_valid() {
            let msg = "No output files defined in the DiagTable. Stopping.";
            error!("{}", msg);
            return Err(SimError::InpOut(msg.to_string()));
        }
        if self.diag_table.calendar().is_none() {
            let calendar = self.calendar();
            self.diag_table.set_calendar(calendar);
        }
        self.diag_table.write(&path)?;
        Ok(())
    }

    // ---- directory management ----

    fn guard_destructive(&self, operation: &'static str) -> Result<()> {
        if self.safe_mode {
            error!(experiment = %self.name, operation, "destructive operation refused in safe mode");
            return Err(SimError::SafeMode { operation });
        }
        Ok(())
    }

    fn ensure_workdir(&self) -> Result<()> {
        debug!("Using directory {}", self.workdir.display());
        std::fs::create_dir_all(&self.workdir)
            .map_err(|e| SimError::io(format!("create {}", self.workdir.display()), e))
    }

    pub fn rm_workdir(&self) -> Result<()> {
        self.guard_destructive("rm_workdir")?;
        if !fsutil::remove_dir_if_exists(&self.workdir)? {
            warn!("Tried to remove working directory but it doesn't exist");
        }
        Ok(())
    }

    pub fn rm_datadir(&self) -> Result<()> {
        self.guard_destructive("rm_datadir")?;
        if !fsutil::remove_dir_if_exists(&self.datadir)? {
            warn!("Tried to remove data directory but it doesn't exist");
        }
        Ok(())
    }

    pub fn clear_workdir(&self) -> Result<()> {
        self.guard_destructive("clear_workdir")?;
        self.ensure_workdir()?;
        self.rm_workdir()?;
        self.ensure_workdir()?;
        info!("Emptied working directory {}", self.workdir.display());
        Ok(())
    }

    pub fn clear_rundir(&self) -> Result<()> {
        self.guard_destructive("clear_rundir")?;
        self.ensure_workdir()?;
        if !fsutil::remove_dir_if_exists(&self.rundir)? {
            warn!("Tried to remove run directory but it doesn't exist");
        }
        std::fs::create_dir_all(&self.rundir)
            .map_err(|e| SimError::io(format!("create {}", self.rundir.display()), e))?;
        info!("Emptied run directory {}", self.rundir.display());
        Ok(())
    }

    /// Delete the restart archive for `run`. Returns whether one existed.
    pub fn delete_restart(&self, run: u32) -> Result<bool> {
        self.guard_destructive("delete_restart")?;
        let path = self.restart_file(run);
        if !path.is_file() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .map_err(|e| SimError::io(format!("delete restart {}", path.display()), e))?;
        info!("Deleted restart file {}", path.display());
        Ok(true)
    }

    // ---- run lifecycle ----

    /// Run `run` to completion, stopping the model on Ctrl-C.
    pub async fn run(&mut self, run: u32, opts: &RunOptions) -> Result<RunOutcome> {
        let interrupt = async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("could not install interrupt handler");
                std::future::pending::<()>().await;
            }
        };
        self.run_with_cancel(run, opts, interrupt).await
    }

    /// Like [`Self::run`], cancelling when `cancel` resolves while the model
    /// is executing. The staging directory is left in place on cancellation.
    pub async fn run_with_cancel<F>(
        &mut self,
        run: u32,
        opts: &RunOptions,
        cancel: F,
    ) -> Result<RunOutcome>
    where
        F: Future<Output = ()>,
    {
        self.guard_destructive("run")?;
        if run == 0 {
            let msg = "run indices start at 1".to_string();
            error!("{}", msg);
            return Err(SimError::Argument(msg));
        }

        let span = obs::run_span(&self.name, run);
        let started = Instant::now();
        let mut record = RunRecord::new(run, &self.rundir, self.output_dir(run));

        let result = self
            .drive(&mut record, opts, cancel)
            .instrument(span.clone())
            .await;

        let _entered = span.enter();
        match &result {
            Ok(_) => {}
            Err(SimError::Cancelled { .. }) => record.transition(RunState::Cancelled),
            Err(e) => {
                error!(error = %e, "run {} failed", run);
                record.transition(RunState::Failed);
            }
        }
        record.finished_at = Some(Utc::now());
        if record.state.is_terminal() {
            obs::emit_run_finished(
                &self.name,
                run,
                started.elapsed().as_millis() as u64,
                record.state,
            );
        }
        self.last_run = Some(record);
        result
    }

    async fn drive<F>(
        &mut self,
        record: &mut RunRecord,
        opts: &RunOptions,
        cancel: F,
    ) -> Result<RunOutcome>
    where
        F: Future<Output = ()>,
    {
        let run = record.run;
        let outdir = record.output_dir.clone();

        if outdir.is_dir() {
            if !opts.overwrite_data {
                obs::emit_run_skipped(&self.name, run, &outdir);
                record.transition(RunState::Skipped);
                return Ok(RunOutcome::Skipped {
                    run,
                    output_dir: outdir,
                });
            }
            warn!(
                "Data for run {} exists and overwrite_data is set. Overwriting.",
                run
            );
            fsutil::remove_dir_if_exists(&outdir)?;
        }
        obs::emit_run_started(&self.name, run, opts.num_cores);

        // Preparing
        record.transition(RunState::Preparing);
        self.clear_rundir()?;
        let rundir = self.rundir.clone();
        for dir in [&record.input_dir, &record.restart_dir, &self.restartdir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| SimError::io(format!("create {}", dir.display()), e))?;
        }
        self.codebase
            .write_source_control_status(&rundir.join(STATUS_FILE))?;
        self.write_namelist(&rundir)?;
        self.write_field_table(&rundir)?;
        self.write_diag_table(&rundir)?;
        for file in &self.input_files {
            fsutil::copy_into(file, &record.input_dir)?;
        }

        let mut launcher_opts = opts.launcher_opts.clone();
        if opts.multi_node {
            launcher_opts.push_str(MULTI_NODE_OPTS);
        }

        // Restoring
        let mut use_restart = opts.use_restart;
        if use_restart && opts.restart_file.is_none() && run == 1 {
            warn!(
                "use_restart is set but no restart file given. As this is run 1, \
                 assuming spin-up from the namelist initial conditions and continuing."
            );
            use_restart = false;
        }
        if use_restart {
            record.transition(RunState::Restoring);
            let source = opts
                .restart_file
                .clone()
                .unwrap_or_else(|| self.restart_file(run - 1));
            if !source.is_file() {
                let msg = format!(
                    "Restart file not found, expecting file {}",
                    source.display()
                );
                error!("{}", msg);
                return Err(SimError::InpOut(msg));
            }
            info!("Using restart file {}", source.display());
            RestartArchiver::extract(&source, &record.input_dir)?;
            record.restart_source = Some(source);
        } else {
            info!("Running without restart file");
        }

        // Executing
        record.transition(RunState::Executing);
        let script = RunScript {
            rundir: rundir.clone(),
            execdir: self.codebase.build_dir().to_path_buf(),
            executable: self.codebase.executable_name().to_string(),
            env_source: self.env_source.clone(),
            launcher: opts.launcher.clone(),
            launcher_opts,
            num_cores: opts.num_cores,
            run_debugger: opts.run_debugger,
            nice_score: opts.nice_score,
        };
        let script_path = rundir.join(RUN_SCRIPT_FILE);
        script.write(&script_path)?;

        self.emit(&RunEvent::Ready { run })?;
        info!("Beginning run {}", run);
        let mut proc = ScriptProcess::spawn(&script_path, &rundir)?;

        tokio::pin!(cancel);
        loop {
            let step = tokio::select! {
                line = proc.next_line() => Step::Line(line),
                _ = &mut cancel => Step::Cancel,
            };
            match step {
                Step::Line(line) => match line? {
                    Some(line) => self.forward_output(line)?,
                    None => break,
                },
                Step::Cancel => {
                    error!("Manual interrupt, killing process.");
                    proc.terminate().await?;
                    return Err(SimError::Cancelled { run });
                }
            }
        }
        let status = proc.wait().await?;
        if !status.success() {
            error!(%status, "Run {} failed. See log for details.", run);
            record.transition(RunState::Failed);
            self.emit(&RunEvent::Failed { run })?;
            return Err(SimError::RunFailed {
                run,
                reason: status.to_string(),
            });
        }

        self.emit(&RunEvent::Complete { run })?;
        info!("Run {} complete", run);
        std::fs::create_dir_all(&outdir)
            .map_err(|e| SimError::io(format!("create {}", outdir.display()), e))?;

        let collected = self.collect(record, opts, &rundir).await;
        match collected {
            Ok(restart_archive) => Ok(RunOutcome::Completed {
                run,
                output_dir: outdir,
                restart_archive,
            }),
            Err(e) => {
                // Partial output must not look like a completed run.
                self.discard_partial_output(record);
                Err(e)
            }
        }
    }

    /// Combining through Finalizing. Returns the restart archive, if any.
    async fn collect(
        &mut self,
        record: &mut RunRecord,
        opts: &RunOptions,
        rundir: &Path,
    ) -> Result<Option<PathBuf>> {
        let run = record.run;
        let outdir = record.output_dir.clone();

        // Combining
        record.transition(RunState::Combining);
        let combiner = OutputCombiner::for_cores(
            opts.num_cores,
            self.codebase.build_dir(),
            &self.env.default_combine_script(),
        );
        let files: Vec<String> = self.diag_table.file_names().map(str::to_string).collect();
        for name in files {
            let file = combiner.consolidate_file(&name, rundir, &outdir).await?;
            self.emit(&RunEvent::FileCombined { run, file })?;
        }
        if combiner.merges() {
            combiner.consolidate_restarts(&record.restart_dir).await?;
            self.emit(&RunEvent::Combined { run })?;
        }

        // Archiving
        record.transition(RunState::Archiving);
        let restart_archive = if opts.archive_restart {
            let archive = self.restart_file(run);
            RestartArchiver::create(&archive, &record.restart_dir)?;
            info!("Restart archive created at {}", archive.display());
            Some(archive)
        } else {
            None
        };
        fsutil::remove_dir_if_exists(&record.restart_dir)?;

        // Finalizing
        record.transition(RunState::Finalizing);
        if opts.save_run {
            fsutil::copy_dir(rundir, &outdir.join("run"))?;
        } else {
            self.write_namelist(&outdir)?;
            self.write_field_table(&outdir)?;
            self.write_diag_table(&outdir)?;
            self.codebase
                .write_source_control_status(&outdir.join(STATUS_FILE))?;
        }
        self.clear_rundir()?;
        self.emit(&RunEvent::Finished { run })?;

        record.success = true;
        record.transition(RunState::Complete);
        Ok(restart_archive)
    }

    /// Remove what a run failing after execution left in the data directory.
    fn discard_partial_output(&self, record: &RunRecord) {
        error!(
            output_dir = %record.output_dir.display(),
            state = ?record.state,
            "removing partial output of failed run {}",
            record.run
        );
        if let Err(e) = fsutil::remove_dir_if_exists(&record.output_dir) {
            error!(error = %e, "could not remove partial output");
        }
        if matches!(record.state, RunState::Archiving | RunState::Finalizing) {
            let archive = self.restart_file(record.run);
            if let Err(e) = std::fs::remove_file(&archive) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(archive = %archive.display(), error = %e, "could not remove restart archive");
                }
            }
        }
    }

    fn emit(&self, event: &RunEvent) -> Result<bool> {
        self.events
            .emit(&self.name, event)
            .map_err(|source| SimError::Hook {
                event: event.kind().name(),
                source,
            })
    }

    fn forward_output(&self, line: String) -> Result<()> {
        let event = RunEvent::Output { line };
        if !self.emit(&event)? {
            if let RunEvent::Output { line } = &event {
                obs::log_model_output(line.trim());
            }
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains(std::path::MAIN_SEPARATOR);
    if bad {
        return Err(SimError::Argument(format!(
            "invalid experiment name '{name}'"
        )));
    }
    Ok(())
}
