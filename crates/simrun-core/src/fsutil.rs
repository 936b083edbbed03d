//! Small filesystem helpers shared by the run lifecycle.

use std::path::Path;

use walkdir::WalkDir;

use crate::error::{Result, SimError};

/// Recursively copy `src` into `dest`, creating directories as needed.
pub fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| {
            let msg = format!("walk {}", src.display());
            SimError::io(msg, e.into())
        })?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| SimError::io(format!("create {}", target.display()), e))?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| {
                SimError::io(
                    format!("copy {} to {}", entry.path().display(), target.display()),
                    e,
                )
            })?;
        }
    }
    Ok(())
}

/// Remove a directory tree. Returns `false` if it did not exist.
pub fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SimError::io(format!("remove {}", path.display()), e)),
    }
}

/// Copy a single file into `dir`, keeping its file name.
pub fn copy_into(file: &Path, dir: &Path) -> Result<()> {
    let name = file
        .file_name()
        .ok_or_else(|| SimError::Argument(format!("{} has no file name", file.display())))?;
    let target = dir.join(name);
    std::fs::copy(file, &target)
        .map(|_| ())
        .map_err(|e| SimError::io(format!("copy {} to {}", file.display(), dir.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_dir_nested() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("a/b")).unwrap();
        std::fs::write(src.join("top.txt"), "1").unwrap();
        std::fs::write(src.join("a/b/deep.txt"), "2").unwrap();

        let dest = dir.path().join("dest");
        copy_dir(&src, &dest).unwrap();
        assert_eq!(std::fs::read_to_string(dest.join("top.txt")).unwrap(), "1");
        assert_eq!(std::fs::read_to_string(dest.join("a/b/deep.txt")).unwrap(), "2");
    }

    #[test]
    fn test_remove_dir_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("gone");
        std::fs::create_dir(&target).unwrap();
        assert!(remove_dir_if_exists(&target).unwrap());
        assert!(!remove_dir_if_exists(&target).unwrap());
    }

    #[test]
    fn test_copy_into_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = copy_into(&dir.path().join("nope.nc"), dir.path()).unwrap_err();
        assert!(err.is_io());
    }
}
