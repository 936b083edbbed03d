//! The compiled model a run executes.
//!
//! Building the model is out of scope here; a [`Codebase`] only has to say
//! where the build output lives and how to record which sources produced it.

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use tracing::warn;

use crate::error::{Result, SimError};

/// Build output and provenance for a model binary.
pub trait Codebase: Send + Sync {
    /// Short model name, e.g. `"isca"` or `"dry"`.
    fn name(&self) -> &str;

    /// Directory containing the executable (and optionally a combine script).
    fn build_dir(&self) -> &Path;

    fn executable_name(&self) -> &str;

    /// Tracer field table shipped with the model sources.
    fn field_table(&self) -> PathBuf;

    /// Record the source revision used for a run at `path`.
    fn write_source_control_status(&self, path: &Path) -> Result<()>;
}

/// A codebase checked out from git and built ahead of time.
#[derive(Debug, Clone)]
pub struct GitCodebase {
    name: String,
    src_dir: PathBuf,
    build_dir: PathBuf,
    executable_name: String,
}

impl GitCodebase {
    pub fn new(
        name: impl Into<String>,
        src_dir: impl Into<PathBuf>,
        build_dir: impl Into<PathBuf>,
        executable_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            src_dir: src_dir.into(),
            build_dir: build_dir.into(),
            executable_name: executable_name.into(),
        }
    }

    pub fn src_dir(&self) -> &Path {
        &self.src_dir
    }
}

impl Codebase for GitCodebase {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    fn executable_name(&self) -> &str {
        &self.executable_name
    }

    fn field_table(&self) -> PathBuf {
        self.src_dir
            .join("extra")
            .join("model")
            .join(&self.name)
            .join("field_table")
    }

    fn write_source_control_status(&self, path: &Path) -> Result<()> {
        let commit = match git_output(&self.src_dir, &["rev-parse", "HEAD"]) {
            Some(sha) if !sha.is_empty() => sha,
            _ => {
                warn!(src_dir = %self.src_dir.display(), "could not read git commit");
                "unknown".to_string()
            }
        };
        let diff = git_output(&self.src_dir, &["diff", "--no-color", "."]).unwrap_or_default();

        let mut body = String::new();
        body.push_str(&format!("recorded_at: {}\n", Utc::now().to_rfc3339()));
        body.push_str(&format!("codebase: {}\n", self.name));
        body.push_str(&format!("commit: {}\n", commit));
        if !diff.is_empty() {
            body.push_str("\n*** uncommitted changes ***\n");
            body.push_str(&diff);
            body.push('\n');
        }
        std::fs::write(path, body)
            .map_err(|e| SimError::io(format!("write source status {}", path.display()), e))
    }
}

fn git_output(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("--no-pager")
        .args(args)
        .current_dir(dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_table_path() {
        let cb = GitCodebase::new("isca", "/src/isca/src", "/work/codebase/build", "isca.x");
        assert_eq!(
            cb.field_table(),
            PathBuf::from("/src/isca/src/extra/model/isca/field_table")
        );
        assert_eq!(cb.executable_name(), "isca.x");
    }

    #[test]
    fn test_status_outside_git_repo_is_unknown() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let cb = GitCodebase::new("dry", src.path(), src.path(), "dry.x");
        let status = out.path().join("git_hash_used.txt");
        cb.write_source_control_status(&status).unwrap();

        let text = std::fs::read_to_string(&status).unwrap();
        assert!(text.contains("commit: unknown"));
        assert!(text.contains("codebase: dry"));
    }

    #[test]
    fn test_status_write_failure_is_io() {
        let src = tempfile::tempdir().unwrap();
        let cb = GitCodebase::new("dry", src.path(), src.path(), "dry.x");
        let err = cb
            .write_source_control_status(&src.path().join("missing/status.txt"))
            .unwrap_err();
        assert!(err.is_io());
    }
}
