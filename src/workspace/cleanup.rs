//! Read-only-tolerant filesystem cleanup.
//!
//! Agent backends sometimes leave read-only files behind (git object
//! stores, cached artifacts), so a plain `remove_dir_all` is not enough.
//! Deletion here clears read-only attributes and retries before giving up.

use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;
use walkdir::WalkDir;

/// Recursively deletes `path`, clearing read-only attributes and retrying
/// once if the first attempt fails.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    if fs::remove_dir_all(path).is_ok() {
        return Ok(());
    }
    clear_readonly(path);
    fs::remove_dir_all(path)
}

/// Deletes a single file, clearing its read-only attribute on a retry.
/// A missing file is not an error.
pub fn remove_file_forced(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(_) => {
            if let Ok(metadata) = fs::metadata(path) {
                let mut permissions = metadata.permissions();
                permissions.set_readonly(false);
                let _ = fs::set_permissions(path, permissions);
            }
            fs::remove_file(path)
        }
    }
}

/// Deletes a job's workspace after its run. Failure is logged and never
/// raised, so cleanup can't mask the job's real outcome.
pub fn remove_workspace(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(error) = remove_tree(path) {
        warn!(workspace = %path.display(), %error, "Failed to remove workspace; leaving it behind");
    }
}

fn clear_readonly(path: &Path) {
    for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
        if let Ok(metadata) = entry.metadata() {
            let mut permissions = metadata.permissions();
            if permissions.readonly() {
                permissions.set_readonly(false);
                let _ = fs::set_permissions(entry.path(), permissions);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_remove_tree_handles_readonly_entries() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("ws");
        fs::create_dir(&dir).unwrap();

        let file = dir.join("locked.md");
        fs::write(&file, "content").unwrap();
        let mut permissions = fs::metadata(&file).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&file, permissions).unwrap();

        remove_tree(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_remove_file_forced_tolerates_missing() {
        let temp = TempDir::new().unwrap();
        remove_file_forced(&temp.path().join("absent.txt")).unwrap();
    }

    #[test]
    fn test_remove_workspace_never_panics_on_missing_path() {
        let temp = TempDir::new().unwrap();
        remove_workspace(&temp.path().join("gone"));
    }
}
