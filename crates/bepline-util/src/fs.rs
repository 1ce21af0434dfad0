//! Filesystem utilities for bepline.

use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::UtilError;

/// Create a directory and all parent directories if they do not exist.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> Result<(), UtilError> {
    std::fs::create_dir_all(path).map_err(|source| UtilError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Write `contents` to `path` via a sibling temp file and a rename.
///
/// Readers never observe a partially written file. Parent directories are
/// created when missing.
///
/// # Errors
/// Returns an error if the temp file cannot be written or renamed into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), UtilError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    std::fs::write(&tmp_path, contents).map_err(|source| UtilError::Io {
        path: tmp_path.display().to_string(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| {
        let _ = remove_file_if_exists(&tmp_path);
        UtilError::Io {
            path: path.display().to_string(),
            source,
        }
    })
}

/// Remove a file. No error if the file is absent.
///
/// # Errors
/// Returns an error if the file exists but cannot be removed.
pub fn remove_file_if_exists(path: &Path) -> Result<(), UtilError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(UtilError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Lexically normalize a path: drop `.` components and fold `..` into the
/// preceding normal component.
///
/// Does not touch the filesystem, so symlinks are not resolved. A `..` that
/// would climb above the start of a relative path is kept.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// Size of the file at `path` in bytes, or 0 when it cannot be read.
///
/// 0 means "unknown", not "empty".
pub fn file_len_or_zero(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Last-modified time of the file at `path` in epoch milliseconds, or 0 when
/// it cannot be determined.
pub fn modified_millis_or_zero(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
