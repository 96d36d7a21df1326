//! Ignore rules shared by the work item producer and the codebase builder.
//!
//! Both sides must agree on the set of scanned paths, so they take the same
//! predicate and walk through [`crate::tree::walk`].

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path};

/// VCS metadata and editor/OS litter.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    ".bzr",
    "CVS",
    ".repo",
    ".DS_Store",
    "Thumbs.db",
    "*~",
    "*.swp",
];

/// Decides whether a path below the scan root is skipped.
///
/// Paths are relative to the scan root. An ignored directory prunes its
/// whole subtree.
pub trait IgnorePredicate: Send + Sync {
    fn is_ignored(&self, path: &Path) -> bool;
}

impl<F> IgnorePredicate for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn is_ignored(&self, path: &Path) -> bool {
        self(path)
    }
}

/// Glob patterns matched against every component of a relative path.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    patterns: Vec<String>,
    set: GlobSet,
}

impl IgnoreRules {
    pub fn new<I, S>(patterns: I) -> Result<Self, globset::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            builder.add(Glob::new(pattern)?);
            kept.push(pattern.to_string());
        }
        Ok(Self {
            patterns: kept,
            set: builder.build()?,
        })
    }

    /// Rules that ignore nothing.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    fn matches_name(&self, name: &std::ffi::OsStr) -> bool {
        self.set.is_match(Path::new(name))
    }
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORE_PATTERNS).expect("default ignore patterns are valid globs")
    }
}

impl IgnorePredicate for IgnoreRules {
    fn is_ignored(&self, path: &Path) -> bool {
        path.components().any(|component| match component {
            Component::Normal(name) => self.matches_name(name),
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules() {
        let rules = IgnoreRules::default();
        assert!(rules.is_ignored(Path::new(".git")));
        assert!(rules.is_ignored(Path::new("src/.git/config")));
        assert!(rules.is_ignored(Path::new("notes.txt~")));
        assert!(rules.is_ignored(Path::new("src/.main.rs.swp")));
        assert!(rules.is_ignored(Path::new("CVS/Entries")));
        assert!(!rules.is_ignored(Path::new("src/main.rs")));
        assert!(!rules.is_ignored(Path::new("gitignore.md")));
    }

    #[test]
    fn test_empty_rules_ignore_nothing() {
        let rules = IgnoreRules::empty();
        assert!(!rules.is_ignored(Path::new(".git/HEAD")));
        assert!(rules.patterns().is_empty());
    }

    #[test]
    fn test_custom_patterns_and_closures() {
        let rules = IgnoreRules::new(["target", "*.log", "  "]).unwrap();
        assert_eq!(rules.patterns(), &["target".to_string(), "*.log".to_string()]);
        assert!(rules.is_ignored(Path::new("target/debug/app")));
        assert!(rules.is_ignored(Path::new("logs/run.log")));

        let only_vendor = |path: &Path| path.starts_with("vendor");
        assert!(only_vendor.is_ignored(Path::new("vendor/lib.c")));
        assert!(!only_vendor.is_ignored(Path::new("src/lib.c")));
    }

    #[test]
    fn test_invalid_pattern_is_error() {
        assert!(IgnoreRules::new(["a[b"]).is_err());
    }
}
