//! Consolidation of per-process output fragments.
//!
//! A parallel run leaves each diagnostics file as `name.nc.0000`,
//! `name.nc.0001`, ... in the run directory. The combine script merges them
//! into `name.nc`; this module sequences the calls and cleans up after them.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, SimError};

/// Combine script looked for in the codebase build directory.
pub const COMBINE_SCRIPT: &str = "mppnccombine_run.sh";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    /// Single process: files are already whole.
    Copy,
    Merge { tool: PathBuf, build_dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct OutputCombiner {
    mode: Mode,
}

impl OutputCombiner {
    /// Pick the strategy for a run on `num_cores` processes.
    ///
    /// Multi-process runs use the build's own combine script, or `fallback`
    /// if the build does not ship one.
    pub fn for_cores(num_cores: u32, build_dir: &Path, fallback: &Path) -> Self {
        if num_cores <= 1 {
            return Self { mode: Mode::Copy };
        }
        let local = build_dir.join(COMBINE_SCRIPT);
        let tool = if local.is_file() {
            local
        } else {
            warn!(
                missing = %local.display(),
                fallback = %fallback.display(),
                "combine script not found in build directory, falling back to shared script"
            );
            fallback.to_path_buf()
        };
        Self {
            mode: Mode::Merge {
                tool,
                build_dir: build_dir.to_path_buf(),
            },
        }
    }

    pub fn merges(&self) -> bool {
        matches!(self.mode, Mode::Merge { .. })
    }

    pub fn tool(&self) -> Option<&Path> {
        match &self.mode {
            Mode::Merge { tool, .. } => Some(tool),
            Mode::Copy => None,
        }
    }

    /// Produce `outdir/<name>.nc` from the run directory and drop its fragments.
    pub async fn consolidate_file(&self, name: &str, rundir: &Path, outdir: &Path) -> Result<PathBuf> {
        let nc_name = format!("{name}.nc");
        let merged = rundir.join(&nc_name);
        if let Mode::Merge { tool, build_dir } = &self.mode {
            run_tool(tool, build_dir, &merged).await?;
        }
        if !merged.is_file() {
            return Err(SimError::InpOut(format!(
                "diagnostics output {} not produced by run",
                merged.display()
            )));
        }

        let dest = outdir.join(&nc_name);
        std::fs::copy(&merged, &dest).map_err(|e| {
            SimError::io(format!("copy {} to {}", merged.display(), dest.display()), e)
        })?;
        let removed = remove_fragments(&merged)?;
        debug!(file = %nc_name, fragments = removed, "output copied to data directory");
        Ok(dest)
    }

    /// Merge restart fragments in `resdir` in place. Returns how many restart
    /// files were combined; always zero for single-process runs.
    pub async fn consolidate_restarts(&self, resdir: &Path) -> Result<usize> {
        let Mode::Merge { tool, build_dir } = &self.mode else {
            return Ok(0);
        };
        let pattern = format!("{}/*.res.nc.0000", glob::Pattern::escape(&resdir.to_string_lossy()));
        let mut combined = 0;
        for first in glob_paths(&pattern)? {
            let restart = first.with_extension("");
            run_tool(tool, build_dir, &restart).await?;
            remove_fragments(&restart)?;
            debug!(restart = %restart.display(), "restart file combined");
            combined += 1;
        }
        Ok(combined)
    }
}

async fn run_tool(tool: &Path, build_dir: &Path, target: &Path) -> Result<()> {
    let output = Command::new("bash")
        .arg(tool)
        .arg(build_dir)
        .arg(target)
        .output()
        .await
        .map_err(|e| SimError::io(format!("launch combine tool {}", tool.display()), e))?;
    if !output.status.success() {
        return Err(SimError::InpOut(format!(
            "combine tool failed for {} ({}): {}",
            target.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Delete `<file>.NNNN` fragments next to `file`.
fn remove_fragments(file: &Path) -> Result<usize> {
    let pattern = format!(
        "{}.[0-9][0-9][0-9][0-9]",
        glob::Pattern::escape(&file.to_string_lossy())
    );
    let mut removed = 0;
    for frag in glob_paths(&pattern)? {
        std::fs::remove_file(&frag)
            .map_err(|e| SimError::io(format!("remove fragment {}", frag.display()), e))?;
        removed += 1;
    }
    Ok(removed)
}

fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob::glob(pattern)
        .map_err(|e| SimError::Argument(format!("bad glob pattern {pattern}: {e}")))?;
    let mut out = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| {
            let path = e.path().display().to_string();
            SimError::io(format!("scan {path}"), e.into_error())
        })?;
        out.push(path);
    }
    out.sort();
    Ok(out)
}
