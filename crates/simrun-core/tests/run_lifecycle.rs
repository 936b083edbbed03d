//! End-to-end runs against a fake model executable.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use simrun_core::{
    Codebase, EventKind, Experiment, RestartArchiver, RunEvent, RunOptions, RunOutcome, RunState,
    SimEnv, SimError,
};

const MODEL_BODY: &str = r#"echo "model starting"
if [ -f INPUT/atmosphere.res.nc ]; then echo "restored $(cat INPUT/atmosphere.res.nc)"; fi
echo "WARNING: fake physics"
echo "daily output" > daily.nc
mkdir -p RESTART
echo "state" > RESTART/atmosphere.res.nc
"#;

const FIELD_TABLE: &str = "\"TRACER\", \"atmos_mod\", \"sphum\"\n/\n";

/// Fake model running `prelude` before the usual output.
fn model(prelude: &str) -> String {
    format!("#!/bin/sh\n{prelude}{MODEL_BODY}")
}

struct FakeCodebase {
    build_dir: PathBuf,
    field_table: PathBuf,
}

impl Codebase for FakeCodebase {
    fn name(&self) -> &str {
        "fake"
    }

    fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    fn executable_name(&self) -> &str {
        "fake.x"
    }

    fn field_table(&self) -> PathBuf {
        self.field_table.clone()
    }

    fn write_source_control_status(&self, path: &Path) -> simrun_core::Result<()> {
        std::fs::write(path, "commit: fake\n").map_err(|e| SimError::Io {
            context: "write status".into(),
            source: e,
        })
    }
}

struct Setup {
    _root: tempfile::TempDir,
    env: SimEnv,
    codebase: Arc<dyn Codebase>,
}

fn setup(model: &str) -> Setup {
    let root = tempfile::tempdir().unwrap();
    let base = root.path().join("base");
    std::fs::create_dir_all(base.join("src/extra/env")).unwrap();
    std::fs::write(base.join("src/extra/env/test"), "export FAKE_ENV=1\n").unwrap();

    let build_dir = root.path().join("build");
    std::fs::create_dir_all(&build_dir).unwrap();
    let exe = build_dir.join("fake.x");
    std::fs::write(&exe, model).unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

    let field_table = root.path().join("field_table");
    std::fs::write(&field_table, FIELD_TABLE).unwrap();

    let env = SimEnv::new(&base, root.path().join("work"), root.path().join("data"), "test");
    let codebase: Arc<dyn Codebase> = Arc::new(FakeCodebase {
        build_dir,
        field_table,
    });
    Setup {
        _root: root,
        env,
        codebase,
    }
}

fn experiment(s: &Setup, name: &str) -> Experiment {
    let mut exp = Experiment::new(name, Arc::clone(&s.codebase), &s.env).unwrap();
    exp.namelist.set("main_nml", "days", 30);
    exp.diag_table.add_file("daily", 1, "days", None);
    exp.diag_table
        .add_field("dynamics", "temp", false, None)
        .unwrap();
    exp
}

fn opts() -> RunOptions {
    RunOptions::new()
        .num_cores(1)
        .launcher(None)
        .use_restart(false)
}

fn record_kinds(exp: &mut Experiment) -> Arc<Mutex<Vec<&'static str>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in EventKind::ALL {
        if kind == EventKind::Output {
            continue;
        }
        let seen = Arc::clone(&seen);
        exp.on(kind, move |_, ev| {
            seen.lock().unwrap().push(ev.kind().name());
            Ok(())
        });
    }
    seen
}

fn capture_output(exp: &mut Experiment) -> Arc<Mutex<Vec<String>>> {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    exp.on(EventKind::Output, move |_, ev| {
        if let RunEvent::Output { line } = ev {
            sink.lock().unwrap().push(line.clone());
        }
        Ok(())
    });
    lines
}

#[tokio::test]
async fn single_core_run_produces_output_and_archive() {
    let s = setup(&model(""));
    let mut exp = experiment(&s, "end_to_end");

    let outcome = exp.run(1, &opts()).await.unwrap();
    let out = exp.output_dir(1);
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            run: 1,
            output_dir: out.clone(),
            restart_archive: Some(exp.restart_file(1)),
        }
    );
    assert!(out.ends_with("run0001"));
    assert_eq!(
        std::fs::read_to_string(out.join("daily.nc")).unwrap(),
        "daily output\n"
    );
    assert!(exp.restart_file(1).ends_with("res0001.tar.gz"));
    assert!(exp.restart_file(1).is_file());

    // lightweight record of the configuration
    for name in ["input.nml", "diag_table", "field_table", "git_hash_used.txt"] {
        assert!(out.join(name).is_file(), "{name} missing");
    }
    // staging emptied
    assert_eq!(std::fs::read_dir(exp.rundir()).unwrap().count(), 0);

    let record = exp.last_run().unwrap();
    assert_eq!(record.state, RunState::Complete);
    assert!(record.success);
    assert!(record.restart_source.is_none());
}

#[tokio::test]
async fn restart_chain_restores_previous_archive() {
    let s = setup(&model(""));
    let mut exp = experiment(&s, "chain");

    exp.run(1, &opts().use_restart(true)).await.unwrap();

    let lines = capture_output(&mut exp);
    exp.run(2, &opts().use_restart(true)).await.unwrap();

    assert!(lines.lock().unwrap().iter().any(|l| l == "restored state"));
    assert_eq!(
        exp.last_run().unwrap().restart_source.as_deref(),
        Some(exp.restart_file(1).as_path())
    );
    assert!(exp.restart_file(2).is_file());
}

#[tokio::test]
async fn missing_restart_fails_without_output() {
    let s = setup(&model(""));
    let mut exp = experiment(&s, "no_restart");

    let err = exp.run(2, &opts().use_restart(true)).await.unwrap_err();
    assert!(matches!(err, SimError::InpOut(_)));
    assert!(err.is_io());
    assert_eq!(exp.last_run().unwrap().state, RunState::Failed);
    assert!(!exp.has_output(2));
}

#[tokio::test]
async fn explicit_restart_file_is_used() {
    let s = setup(&model(""));
    let mut exp = experiment(&s, "explicit");

    let staged = tempfile::tempdir().unwrap();
    let src = staged.path().join("res");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("atmosphere.res.nc"), "spun-up").unwrap();
    let archive = staged.path().join("spinup.tar.gz");
    RestartArchiver::create(&archive, &src).unwrap();

    let lines = capture_output(&mut exp);
    exp.run(1, &opts().use_restart(true).restart_file(&archive))
        .await
        .unwrap();
    assert!(lines.lock().unwrap().iter().any(|l| l == "restored spun-up"));
}

#[tokio::test]
async fn existing_output_is_skipped_untouched() {
    let s = setup(&model(""));
    let mut exp = experiment(&s, "skip");
    let out = exp.output_dir(1);
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("daily.nc"), "old data").unwrap();

    let seen = record_kinds(&mut exp);
    let outcome = exp.run(1, &opts()).await.unwrap();

    assert!(outcome.is_skipped());
    assert_eq!(std::fs::read_to_string(out.join("daily.nc")).unwrap(), "old data");
    assert_eq!(std::fs::read_dir(&out).unwrap().count(), 1);
    assert!(!exp.rundir().exists());
    assert!(seen.lock().unwrap().is_empty());

    let record = exp.last_run().unwrap();
    assert_eq!(record.state, RunState::Skipped);
    assert!(record.finished_at.is_some());
}

#[tokio::test]
async fn overwrite_replaces_existing_output() {
    let s = setup(&model(""));
    let mut exp = experiment(&s, "overwrite");
    let out = exp.output_dir(1);
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("marker"), "stale").unwrap();

    let outcome = exp.run(1, &opts().overwrite_data(true)).await.unwrap();
    assert!(!outcome.is_skipped());
    assert!(!out.join("marker").exists());
    assert!(out.join("daily.nc").is_file());
}

#[tokio::test]
async fn failing_model_reports_run_index() {
    let s = setup("#!/bin/sh\necho \"FATAL: blew up\"\nexit 3\n");
    let mut exp = experiment(&s, "crash");
    let seen = record_kinds(&mut exp);

    let err = exp.run(4, &opts()).await.unwrap_err();
    assert!(matches!(err, SimError::RunFailed { run: 4, .. }));
    assert_eq!(*seen.lock().unwrap(), vec!["run:ready", "run:failed"]);
    assert_eq!(exp.last_run().unwrap().state, RunState::Failed);
    assert!(!exp.has_output(4));
    assert!(!exp.restart_file(4).exists());
}

#[tokio::test]
async fn cancellation_stops_model_and_keeps_staging() {
    let s = setup("#!/bin/sh\necho started\nexec sleep 30\n");
    let mut exp = experiment(&s, "cancel");

    let started = std::time::Instant::now();
    let err = exp
        .run_with_cancel(1, &opts(), tokio::time::sleep(Duration::from_millis(300)))
        .await
        .unwrap_err();

    assert!(matches!(err, SimError::Cancelled { run: 1 }));
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(exp.last_run().unwrap().state, RunState::Cancelled);
    assert!(exp.rundir().join("run.sh").is_file());
    assert!(exp.rundir().join("input.nml").is_file());
    assert!(!exp.has_output(1));
}

#[tokio::test]
async fn events_fire_in_lifecycle_order() {
    let s = setup(&model(""));
    let mut exp = experiment(&s, "events");
    let seen = record_kinds(&mut exp);
    let lines = capture_output(&mut exp);

    exp.run(1, &opts()).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["run:ready", "run:complete", "run:file_combined", "run:finished"]
    );
    let lines = lines.lock().unwrap();
    assert_eq!(lines[0], "model starting");
    assert!(lines.iter().any(|l| l.contains("WARNING")));
}

#[tokio::test]
async fn multi_core_run_combines_fragments() {
    let model = r#"#!/bin/sh
echo "a" > daily.nc.0000
echo "b" > daily.nc.0001
mkdir -p RESTART
echo "r0" > RESTART/atmosphere.res.nc.0000
echo "r1" > RESTART/atmosphere.res.nc.0001
"#;
    let s = setup(model);
    std::fs::write(
        s.codebase.build_dir().join("mppnccombine_run.sh"),
        "cat \"$2\".[0-9][0-9][0-9][0-9] > \"$2\"\n",
    )
    .unwrap();
    let mut exp = experiment(&s, "parallel");
    let seen = record_kinds(&mut exp);

    exp.run(1, &opts().num_cores(2)).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            "run:ready",
            "run:complete",
            "run:file_combined",
            "run:combined",
            "run:finished"
        ]
    );
    assert_eq!(
        std::fs::read_to_string(exp.output_dir(1).join("daily.nc")).unwrap(),
        "a\nb\n"
    );

    let restored = tempfile::tempdir().unwrap();
    RestartArchiver::extract(&exp.restart_file(1), restored.path()).unwrap();
    assert_eq!(
        std::fs::read_to_string(restored.path().join("atmosphere.res.nc")).unwrap(),
        "r0\nr1\n"
    );
    assert!(!restored.path().join("atmosphere.res.nc.0000").exists());
}

#[tokio::test]
async fn subscriber_error_aborts_run() {
    let s = setup(&model(""));
    let mut exp = experiment(&s, "hook");
    exp.on(EventKind::RunReady, |_, _| anyhow::bail!("not today"));

    let err = exp.run(1, &opts()).await.unwrap_err();
    match err {
        SimError::Hook { event, source } => {
            assert_eq!(event, "run:ready");
            assert_eq!(source.to_string(), "not today");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(exp.last_run().unwrap().state, RunState::Failed);
}

#[tokio::test]
async fn save_run_copies_staging_directory() {
    let s = setup(&model(""));
    let mut exp = experiment(&s, "saved");

    exp.run(1, &opts().save_run(true)).await.unwrap();
    let saved = exp.output_dir(1).join("run");
    assert!(saved.join("input.nml").is_file());
    assert!(saved.join("run.sh").is_file());
    assert!(!saved.join("RESTART").exists());
}

#[tokio::test]
async fn safe_mode_refuses_runs() {
    let s = setup(&model(""));
    let mut exp = experiment(&s, "safe").with_safe_mode(true);

    let err = exp.run(1, &opts()).await.unwrap_err();
    assert!(matches!(err, SimError::SafeMode { operation: "run" }));
    assert!(!exp.workdir().exists());
}

#[tokio::test]
async fn skipping_archive_leaves_no_restart() {
    let s = setup(&model(""));
    let mut exp = experiment(&s, "no_archive");

    let outcome = exp.run(1, &opts().archive_restart(false)).await.unwrap();
    match outcome {
        RunOutcome::Completed {
            restart_archive, ..
        } => assert!(restart_archive.is_none()),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!exp.restart_file(1).exists());
}

#[tokio::test]
async fn non_utf8_output_is_relayed_lossily() {
    let s = setup(&model("printf 'temp \\377 K\\n'\n"));
    let mut exp = experiment(&s, "bytes");
    let lines = capture_output(&mut exp);

    exp.run(1, &opts()).await.unwrap();

    assert_eq!(lines.lock().unwrap()[0], "temp \u{FFFD} K");
    assert!(exp.output_dir(1).join("daily.nc").is_file());
    assert_eq!(exp.last_run().unwrap().state, RunState::Complete);
}

#[tokio::test]
async fn failure_after_execution_leaves_no_output() {
    // Exits cleanly but never writes daily.nc.
    let s = setup("#!/bin/sh\nmkdir -p RESTART\necho state > RESTART/atmosphere.res.nc\n");
    let mut exp = experiment(&s, "partial");

    let err = exp.run(1, &opts()).await.unwrap_err();
    assert!(matches!(err, SimError::InpOut(_)));
    assert_eq!(exp.last_run().unwrap().state, RunState::Failed);
    assert!(!exp.has_output(1));
    assert!(!exp.restart_file(1).exists());

    // a retry runs again instead of skipping
    let err = exp.run(1, &opts()).await.unwrap_err();
    assert!(matches!(err, SimError::InpOut(_)));
}

#[tokio::test]
async fn failing_finished_hook_discards_output_and_archive() {
    let s = setup(&model(""));
    let mut exp = experiment(&s, "late_hook");
    exp.on(EventKind::RunFinished, |_, _| anyhow::bail!("catalogue offline"));

    let err = exp.run(1, &opts()).await.unwrap_err();
    assert!(matches!(err, SimError::Hook { event: "run:finished", .. }));
    assert!(!exp.has_output(1));
    assert!(!exp.restart_file(1).exists());
}

#[tokio::test]
async fn input_files_and_field_table_are_staged() {
    let s = setup(&model("ls INPUT\ncat field_table\n"));
    let mut exp = experiment(&s, "inputs");

    let extra = tempfile::tempdir().unwrap();
    let ozone = extra.path().join("ozone_1990.nc");
    std::fs::write(&ozone, "ozone").unwrap();
    exp.add_input_file(&ozone);
    let lines = capture_output(&mut exp);

    exp.run(1, &opts()).await.unwrap();

    let lines = lines.lock().unwrap();
    assert!(lines.iter().any(|l| l == "ozone_1990.nc"));
    assert!(lines.iter().any(|l| l == "\"TRACER\", \"atmos_mod\", \"sphum\""));
    assert_eq!(
        std::fs::read_to_string(exp.output_dir(1).join("field_table")).unwrap(),
        FIELD_TABLE
    );
}
