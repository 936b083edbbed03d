//! Execution script generation and the model subprocess.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::error::{Result, SimError};

/// Parameters for the `run.sh` launched for every run.
#[derive(Debug, Clone)]
pub struct RunScript {
    pub rundir: PathBuf,
    pub execdir: PathBuf,
    pub executable: String,
    /// Environment setup file sourced first.
    pub env_source: PathBuf,
    /// Process launcher such as `mpirun`; `None` runs the binary directly.
    pub launcher: Option<String>,
    pub launcher_opts: String,
    pub num_cores: u32,
    /// Wrap the binary in `gdb -batch` and print a backtrace on crash.
    pub run_debugger: bool,
    pub nice_score: i32,
}

impl RunScript {
    pub fn render(&self) -> String {
        let mut cmd = format!("exec nice -n {}", self.nice_score);
        if let Some(launcher) = &self.launcher {
            cmd.push(' ');
            cmd.push_str(&shell_quote(launcher));
            let opts = self.launcher_opts.trim();
            if !opts.is_empty() {
                // Options are passed through verbatim so `$PBS_NODEFILE` expands.
                cmd.push(' ');
                cmd.push_str(opts);
            }
            cmd.push_str(&format!(" -np {}", self.num_cores));
        }
        if self.run_debugger {
            cmd.push_str(" gdb -batch -ex run -ex bt --args");
        }
        cmd.push(' ');
        cmd.push_str(&shell_quote(
            &self.execdir.join(&self.executable).to_string_lossy(),
        ));

        format!(
            "#!/usr/bin/env bash\n\
             exec 2>&1\n\
             source {}\n\
             cd {}\n\
             ulimit -s unlimited 2>/dev/null || true\n\
             {}\n",
            shell_quote(&self.env_source.to_string_lossy()),
            shell_quote(&self.rundir.to_string_lossy()),
            cmd
        )
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render())
            .map_err(|e| SimError::io(format!("write run script {}", path.display()), e))
    }
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:+=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// A running `run.sh`, with stdout (stderr merged in) readable per line.
pub struct ScriptProcess {
    child: Child,
    stdout: BufReader<ChildStdout>,
    buf: Vec<u8>,
}

/// How long a model gets to exit after SIGTERM before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(10);

impl ScriptProcess {
    pub fn spawn(script: &Path, cwd: &Path) -> Result<Self> {
        let mut child = Command::new("bash")
            .arg(script)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SimError::io(format!("launch {}", script.display()), e))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SimError::io(
                "capture model output",
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdout not piped"),
            )
        })?;
        info!(pid = child.id(), script = %script.display(), "process running");
        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            buf: Vec::new(),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Next output line, or `None` once the stream closes.
    ///
    /// Bytes that are not valid UTF-8 are replaced rather than rejected.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        self.buf.clear();
        let read = self
            .stdout
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|e| SimError::io("read model output", e))?;
        if read == 0 {
            return Ok(None);
        }
        let mut end = self.buf.len();
        while end > 0 && matches!(self.buf[end - 1], b'\n' | b'\r') {
            end -= 1;
        }
        Ok(Some(String::from_utf8_lossy(&self.buf[..end]).into_owned()))
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child
            .wait()
            .await
            .map_err(|e| SimError::io("wait for model process", e))
    }

    /// Ask the process to stop and reap it, waiting [`TERMINATE_GRACE`].
    pub async fn terminate(&mut self) -> Result<ExitStatus> {
        self.terminate_within(TERMINATE_GRACE).await
    }

    /// Send SIGTERM so the launcher can forward it to its ranks, then kill
    /// the process if it is still alive after `grace`.
    pub async fn terminate_within(&mut self, grace: Duration) -> Result<ExitStatus> {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return self.wait().await;
        };
        debug!(pid, "sending SIGTERM to model process");
        request_stop(pid);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status.map_err(|e| SimError::io("wait for model process", e)),
            Err(_) => {
                warn!(pid, grace_ms = grace.as_millis() as u64, "model ignored SIGTERM, killing");
                if let Err(e) = self.child.start_kill() {
                    if e.kind() != std::io::ErrorKind::InvalidInput {
                        return Err(SimError::io("kill model process", e));
                    }
                }
                self.wait().await
            }
        }
    }
}

#[cfg(unix)]
fn request_stop(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM not delivered");
    }
}

#[cfg(not(unix))]
fn request_stop(_pid: u32) {}
