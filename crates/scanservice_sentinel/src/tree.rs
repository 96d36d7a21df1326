//! Path helpers and the filesystem walk shared by the producer and the
//! codebase builder.

use crate::ignore::IgnorePredicate;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::{DirEntry, WalkDir};

/// Absolute form of `path` with `.` components removed. Symlinks are not
/// resolved.
pub fn normalize_root(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    Ok(absolute
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect())
}

/// Path of `path` relative to the parent of `root`, with `/` separators.
///
/// `/a/b` and `/a/b/file.txt` give `b/file.txt`; a file root `/a/b/file.txt`
/// gives `file.txt`. `None` when a component of the result is not valid
/// UTF-8: such names have no lossless string key and are reported instead.
pub fn scan_relative_path(root: &Path, path: &Path) -> Option<String> {
    let base = root.parent().unwrap_or(root);
    let relative = path.strip_prefix(base).unwrap_or(path);
    join_components(relative)
}

/// Path of `path` relative to `root` itself, used for ignore decisions.
pub fn root_relative(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_path_buf()
}

fn join_components(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        if let Component::Normal(name) = component {
            parts.push(name.to_str()?);
        }
    }
    Some(parts.join("/"))
}

/// Recursive walk below `root` that prunes ignored entries. The root itself
/// is never ignored. Symlinks are not followed.
pub fn walk(
    root: PathBuf,
    ignore: Arc<dyn IgnorePredicate>,
) -> impl Iterator<Item = walkdir::Result<DirEntry>> + Send + 'static {
    WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            entry.depth() == 0 || !ignore.is_ignored(&root_relative(&root, entry.path()))
        })
}
