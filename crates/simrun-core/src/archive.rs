//! Restart archives: one gzip-compressed tar per run.
//!
//! Members are stored relative to the archived directory, so extracting
//! into `INPUT/` recreates the restart files directly under it.

use std::fs::File;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, error};

use crate::error::{Result, SimError};

/// Packs and unpacks restart directories.
#[derive(Debug, Default, Clone, Copy)]
pub struct RestartArchiver;

impl RestartArchiver {
    /// Archive the contents of `source_dir` into `archive`.
    pub fn create(archive: &Path, source_dir: &Path) -> Result<()> {
        if !source_dir.is_dir() {
            let msg = format!("restart directory {} not found", source_dir.display());
            error!("{}", msg);
            return Err(SimError::InpOut(msg));
        }
        if let Some(parent) = archive.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SimError::io(format!("create {}", parent.display()), e))?;
        }

        let context = || format!("write restart archive {}", archive.display());
        let file = File::create(archive).map_err(|e| SimError::io(context(), e))?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.follow_symlinks(true);
        builder
            .append_dir_all(".", source_dir)
            .map_err(|e| SimError::io(context(), e))?;
        builder
            .into_inner()
            .and_then(|gz| gz.finish())
            .map_err(|e| SimError::io(context(), e))?;

        debug!(archive = %archive.display(), source = %source_dir.display(), "restart archive written");
        Ok(())
    }

    /// Unpack `archive` into `dest`, creating it if needed.
    pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
        let context = || format!("extract restart archive {}", archive.display());
        let file = File::open(archive).map_err(|e| SimError::io(context(), e))?;
        std::fs::create_dir_all(dest)
            .map_err(|e| SimError::io(format!("create {}", dest.display()), e))?;
        tar::Archive::new(GzDecoder::new(file))
            .unpack(dest)
            .map_err(|e| SimError::io(context(), e))?;

        debug!(archive = %archive.display(), dest = %dest.display(), "restart archive extracted");
        Ok(())
    }
}
