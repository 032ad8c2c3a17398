//! Atomic filesystem helpers
//!
//! Writers in this crate never leave a half-written file behind: content is
//! written to a temporary file in the destination directory and renamed over
//! the target, so readers (the container runtime, the kubelet) either see the
//! old file or the complete new one.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from filesystem operations
#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("path has no parent directory: {0}")]
    NoParent(PathBuf),
}

impl FsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FsError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Returns true if something exists at `path`
pub fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// Write `data` to `path` with the given file mode, atomically
pub fn atomic_write(path: &Path, data: &[u8], mode: u32) -> Result<(), FsError> {
    let dir = path
        .parent()
        .ok_or_else(|| FsError::NoParent(path.to_path_buf()))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".msm-cni-")
        .tempfile_in(dir)
        .map_err(|e| FsError::io(dir, e))?;

    tmp.write_all(data).map_err(|e| FsError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsError::io(tmp.path(), e))?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))
        .map_err(|e| FsError::io(tmp.path(), e))?;

    tmp.persist(path).map_err(|e| FsError::io(path, e.error))?;
    Ok(())
}

/// Copy `src` into `target_dir/filename`, atomically, keeping the source mode
pub fn atomic_copy(src: &Path, target_dir: &Path, filename: &str) -> Result<(), FsError> {
    let data = fs::read(src).map_err(|e| FsError::io(src, e))?;
    let mode = fs::metadata(src)
        .map_err(|e| FsError::io(src, e))?
        .permissions()
        .mode();

    atomic_write(&target_dir.join(filename), &data, mode & 0o7777)
}

/// Remove a file, treating "already gone" as success
pub fn remove_if_exists(path: &Path) -> Result<bool, FsError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FsError::io(path, e)),
    }
}

/// Check that a directory exists and new files can be created in it
pub fn is_dir_writable(dir: &Path) -> Result<(), FsError> {
    let meta = fs::metadata(dir).map_err(|e| FsError::io(dir, e))?;
    if !meta.is_dir() {
        return Err(FsError::io(
            dir,
            io::Error::new(io::ErrorKind::Other, "not a directory"),
        ));
    }

    // The probe file is removed when dropped
    tempfile::Builder::new()
        .prefix(".msm-cni-probe-")
        .tempfile_in(dir)
        .map(|_| ())
        .map_err(|e| FsError::io(dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_sets_content_and_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kubeconfig");

        atomic_write(&path, b"hello", 0o600).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("10-net.conflist");

        atomic_write(&path, b"first", 0o644).unwrap();
        atomic_write(&path, b"second", 0o644).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_atomic_write_missing_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("file");

        let err = atomic_write(&path, b"x", 0o644).unwrap_err();
        assert!(matches!(err, FsError::Io { .. }));
    }

    #[test]
    fn test_atomic_copy_keeps_mode() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let src = src_dir.path().join("msm-cni");
        fs::write(&src, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o755)).unwrap();

        atomic_copy(&src, dst_dir.path(), "msm-cni").unwrap();

        let copied = dst_dir.path().join("msm-cni");
        assert_eq!(fs::read(&copied).unwrap(), b"#!/bin/sh\n");
        let mode = fs::metadata(&copied).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone");
        fs::write(&path, b"x").unwrap();

        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
        assert!(!exists(&path));
    }

    #[test]
    fn test_is_dir_writable() {
        let dir = TempDir::new().unwrap();
        assert!(is_dir_writable(dir.path()).is_ok());
        assert!(is_dir_writable(&dir.path().join("nope")).is_err());

        // Probe file must not linger
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
