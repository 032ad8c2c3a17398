//! Plugin binary installation

use super::InstallError;
use crate::fs::{atomic_copy, exists, is_dir_writable, remove_if_exists};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Copy every file in `src_dir` into each writable target directory
///
/// Names in `skip` are never copied. Files already present in a target are
/// left alone unless `update` is set.
pub fn copy_binaries(
    src_dir: &Path,
    target_dirs: &[PathBuf],
    update: bool,
    skip: &[String],
) -> Result<usize, InstallError> {
    let skip: HashSet<&str> = skip.iter().map(String::as_str).collect();
    let mut copied = 0;

    for target_dir in target_dirs {
        if let Err(e) = is_dir_writable(target_dir) {
            info!(dir = %target_dir.display(), error = %e, "Directory is not writable, skipping");
            continue;
        }

        let entries = fs::read_dir(src_dir).map_err(|e| InstallError::io(src_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| InstallError::io(src_dir, e))?;
            let filename = entry.file_name().to_string_lossy().into_owned();

            if skip.contains(filename.as_str()) {
                info!(binary = %filename, "Binary is in the skip list, skipping");
                continue;
            }

            let file_type = entry
                .file_type()
                .map_err(|e| InstallError::io(entry.path(), e))?;
            if file_type.is_dir() {
                debug!(path = %entry.path().display(), "Not a file, skipping");
                continue;
            }

            let target = target_dir.join(&filename);
            if exists(&target) && !update {
                info!(path = %target.display(), "Binary already present and updates are disabled, skipping");
                continue;
            }

            atomic_copy(&entry.path(), target_dir, &filename)?;
            copied += 1;
            info!(binary = %filename, dir = %target_dir.display(), "Copied binary");
        }
    }

    Ok(copied)
}

/// Remove the plugin's binaries from every target directory
///
/// Stops at the first removal that fails.
pub fn remove_binaries(target_dirs: &[PathBuf], names: &[&str]) -> Result<(), InstallError> {
    for target_dir in target_dirs {
        for name in names {
            let path = target_dir.join(name);
            if remove_if_exists(&path)? {
                info!(path = %path.display(), "Removed binary");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("msm-cni"), b"plugin-v2").unwrap();
        fs::write(dir.path().join("msm-iptables"), b"helper-v2").unwrap();
        dir
    }

    #[test]
    fn test_copy_into_every_target() {
        let src = source_dir();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();

        let copied = copy_binaries(
            src.path(),
            &[a.path().to_path_buf(), b.path().to_path_buf()],
            true,
            &[],
        )
        .unwrap();

        assert_eq!(copied, 4);
        assert_eq!(fs::read(a.path().join("msm-cni")).unwrap(), b"plugin-v2");
        assert_eq!(fs::read(b.path().join("msm-iptables")).unwrap(), b"helper-v2");
    }

    #[test]
    fn test_skip_list_and_existing_files() {
        let src = source_dir();
        let target = TempDir::new().unwrap();
        fs::write(target.path().join("msm-cni"), b"plugin-v1").unwrap();

        let copied = copy_binaries(
            src.path(),
            &[target.path().to_path_buf()],
            false,
            &["msm-iptables".to_string()],
        )
        .unwrap();

        assert_eq!(copied, 0);
        assert_eq!(fs::read(target.path().join("msm-cni")).unwrap(), b"plugin-v1");
        assert!(!target.path().join("msm-iptables").exists());
    }

    #[test]
    fn test_update_overwrites_existing() {
        let src = source_dir();
        let target = TempDir::new().unwrap();
        fs::write(target.path().join("msm-cni"), b"plugin-v1").unwrap();

        copy_binaries(src.path(), &[target.path().to_path_buf()], true, &[]).unwrap();

        assert_eq!(fs::read(target.path().join("msm-cni")).unwrap(), b"plugin-v2");
    }

    #[test]
    fn test_missing_target_dir_is_skipped() {
        let src = source_dir();
        let root = TempDir::new().unwrap();

        let copied = copy_binaries(
            src.path(),
            &[root.path().join("secondary-bin-dir")],
            true,
            &[],
        )
        .unwrap();

        assert_eq!(copied, 0);
    }

    #[test]
    fn test_missing_source_dir_is_fatal() {
        let root = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        let res = copy_binaries(
            &root.path().join("no-bin"),
            &[target.path().to_path_buf()],
            true,
            &[],
        );
        assert!(matches!(res, Err(InstallError::Io { .. })));
    }

    #[test]
    fn test_remove_binaries() {
        let target = TempDir::new().unwrap();
        fs::write(target.path().join("msm-cni"), b"x").unwrap();
        fs::write(target.path().join("bridge"), b"x").unwrap();

        remove_binaries(
            &[target.path().to_path_buf()],
            &["msm-cni", "msm-iptables"],
        )
        .unwrap();

        assert!(!target.path().join("msm-cni").exists());
        assert!(target.path().join("bridge").exists());
    }
}
