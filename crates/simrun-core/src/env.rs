//! Installation and storage roots for a model environment.
//!
//! Resolved once at process start and passed by reference to every
//! experiment. The variables follow the model's own conventions:
//!
//! | variable    | meaning                                      | required |
//! |-------------|----------------------------------------------|----------|
//! | `GFDL_BASE` | model source / install root                  | yes      |
//! | `GFDL_WORK` | scratch root for run staging directories      | yes      |
//! | `GFDL_DATA` | permanent storage for output and restarts     | yes      |
//! | `GFDL_SOC`  | secondary model root (radiation code)         | no       |
//! | `GFDL_ENV`  | environment profile, selects the setup script | no       |

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{error, warn};

use crate::error::{Result, SimError};

pub const BASE_VAR: &str = "GFDL_BASE";
pub const WORK_VAR: &str = "GFDL_WORK";
pub const DATA_VAR: &str = "GFDL_DATA";
pub const SECONDARY_VAR: &str = "GFDL_SOC";
pub const PROFILE_VAR: &str = "GFDL_ENV";

/// Shared combine script used when a build does not ship its own.
const DEFAULT_COMBINE_SCRIPT: &str = "mppnccombine_run.sh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimEnv {
    base_dir: PathBuf,
    work_dir: PathBuf,
    data_dir: PathBuf,
    secondary_dir: Option<PathBuf>,
    profile: String,
}

impl SimEnv {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            work_dir: work_dir.into(),
            data_dir: data_dir.into(),
            secondary_dir: None,
            profile: profile.into(),
        }
    }

    pub fn with_secondary_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.secondary_dir = Some(dir.into());
        self
    }

    /// Read the environment from process variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    ///
    /// Missing roots fail fast. A missing profile falls back to the host's
    /// fully-qualified name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let (base, work, data) = match (required(BASE_VAR), required(WORK_VAR), required(DATA_VAR)) {
            (Some(b), Some(w), Some(d)) => (b, w, d),
            _ => {
                let msg = format!(
                    "environment variables {}, {}, {} must be set",
                    BASE_VAR, WORK_VAR, DATA_VAR
                );
                error!("{}", msg);
                return Err(SimError::Env(msg));
            }
        };

        let secondary = required(SECONDARY_VAR).map(PathBuf::from);
        if secondary.is_none() {
            warn!(
                "{} not set; only needed for codebases using the secondary model",
                SECONDARY_VAR
            );
        }

        let profile = match required(PROFILE_VAR) {
            Some(p) => p,
            None => {
                let host = host_fqdn()?;
                warn!("{} not set, using {}", PROFILE_VAR, host);
                host
            }
        };

        Ok(Self {
            base_dir: PathBuf::from(base),
            work_dir: PathBuf::from(work),
            data_dir: PathBuf::from(data),
            secondary_dir: secondary,
            profile,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn secondary_dir(&self) -> Option<&Path> {
        self.secondary_dir.as_deref()
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Setup script sourced before the model runs.
    pub fn env_file(&self) -> PathBuf {
        self.base_dir
            .join("src")
            .join("extra")
            .join("env")
            .join(&self.profile)
    }

    /// Like [`Self::env_file`], but the file must exist.
    pub fn resolve_env_file(&self) -> Result<PathBuf> {
        let path = self.env_file();
        if path.is_file() {
            Ok(path)
        } else {
            let msg = format!("Environment file {} not found", path.display());
            error!("{}", msg);
            Err(SimError::InpOut(msg))
        }
    }

    pub fn default_combine_script(&self) -> PathBuf {
        self.base_dir
            .join("postprocessing")
            .join(DEFAULT_COMBINE_SCRIPT)
    }
}

fn host_fqdn() -> Result<String> {
    let output = Command::new("hostname")
        .arg("-f")
        .output()
        .map_err(|e| SimError::Env(format!("{} not set and hostname unavailable: {e}", PROFILE_VAR)))?;
    let host = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || host.is_empty() {
        return Err(SimError::Env(format!(
            "{} not set and hostname lookup failed",
            PROFILE_VAR
        )));
    }
    Ok(host)
}
