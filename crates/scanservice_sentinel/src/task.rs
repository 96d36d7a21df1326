//! Top-level scan tasks.

use crate::tree::{normalize_root, scan_relative_path};
use chrono::{DateTime, Utc};
use scanservice_protocol::TaskId;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("File or directory '{}' of variable 'scan_path' not found.", .0.display())]
    PathNotFound(PathBuf),

    #[error("Scan path name is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),

    #[error("Scan service is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    File,
    Directory,
}

impl RootKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootKind::File => "file",
            RootKind::Directory => "dir",
        }
    }
}

/// One requested scan. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTask {
    pub id: TaskId,
    /// Absolute scan root.
    pub root: PathBuf,
    pub kind: RootKind,
    pub output: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl ScanTask {
    /// Validate the root and create a task with a fresh id.
    pub fn new(root: impl AsRef<Path>, output: impl Into<PathBuf>) -> Result<Self, SubmitError> {
        let requested = root.as_ref();
        let not_found = || SubmitError::PathNotFound(requested.to_path_buf());
        let root = normalize_root(requested).map_err(|_| not_found())?;

        let kind = match std::fs::metadata(&root) {
            Ok(meta) if meta.is_file() => RootKind::File,
            Ok(meta) if meta.is_dir() => RootKind::Directory,
            _ => return Err(not_found()),
        };
        if scan_relative_path(&root, &root).is_none() {
            return Err(SubmitError::NonUtf8Path(requested.to_path_buf()));
        }

        Ok(Self {
            id: TaskId::new(),
            root,
            kind,
            output: output.into(),
            created_at: Utc::now(),
        })
    }
}
