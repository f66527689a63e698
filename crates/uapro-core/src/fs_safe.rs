//! Whole-file write primitives.
//!
//! Every persisted artifact (machine token, message files, the host lock) is
//! rewritten as a whole: data lands in a temporary file in the target's
//! directory, is synced, and is then renamed into place. Readers therefore
//! see either the previous content or the new content, never a prefix.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

/// Outcome of [`create_new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The file did not exist and now holds the requested content.
    Created,
    /// A file already existed at the target path; nothing was written.
    AlreadyExists,
}

/// Atomically replace `target` with `data`, setting `mode` on Unix.
///
/// Parent directories are created as needed.
///
/// # Errors
///
/// Returns the underlying I/O error if the parent cannot be created, the
/// temporary file cannot be written, or the final rename fails.
pub fn atomic_write(target: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    let temp = staged(target, data, mode)?;
    temp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Atomically create `target` with `data` only if nothing exists there yet.
///
/// # Errors
///
/// Returns the underlying I/O error for any failure other than the target
/// already existing.
pub fn create_new(target: &Path, data: &[u8], mode: u32) -> io::Result<CreateOutcome> {
    let temp = staged(target, data, mode)?;
    match temp.persist_noclobber(target) {
        Ok(_) => Ok(CreateOutcome::Created),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(CreateOutcome::AlreadyExists),
        Err(e) => Err(e.error),
    }
}

/// Remove a file, treating a missing file as success.
///
/// Returns `true` if a file was removed.
///
/// # Errors
///
/// Returns the underlying I/O error for anything but `NotFound`.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn staged(target: &Path, data: &[u8], mode: u32) -> io::Result<NamedTempFile> {
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent directory"))?;
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode)) {
            tracing::warn!(path = %temp.path().display(), err = %e, "failed to set temp file permissions");
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    Ok(temp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("file.txt");

        atomic_write(&target, b"first", 0o644).unwrap();
        atomic_write(&target, b"second", 0o644).unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "second");
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_applies_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("secret.json");
        atomic_write(&target, b"{}", 0o600).unwrap();

        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn create_new_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("lock");

        assert_eq!(create_new(&target, b"1:a", 0o600).unwrap(), CreateOutcome::Created);
        assert_eq!(
            create_new(&target, b"2:b", 0o600).unwrap(),
            CreateOutcome::AlreadyExists
        );
        assert_eq!(fs::read_to_string(&target).unwrap(), "1:a");
    }

    #[test]
    fn remove_if_exists_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("gone");
        fs::write(&target, "x").unwrap();

        assert!(remove_if_exists(&target).unwrap());
        assert!(!remove_if_exists(&target).unwrap());
    }
}
