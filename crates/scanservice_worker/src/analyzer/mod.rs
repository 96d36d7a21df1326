//! Content analyzers.
//!
//! An analyzer is a stateless function of `(location, deadline, options)`.
//! Deadlines are cooperative: analyzers poll [`Deadline::is_expired`] while
//! they work and return whatever they found so far once it passes.

mod copyrights;
mod file_info;
mod licenses;

pub use copyrights::CopyrightAnalyzer;
pub use file_info::FileInfoAnalyzer;
pub use licenses::LicenseAnalyzer;

use scanservice_protocol::{AnalyzerOptions, AttributeMapping, Deadline};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Failed(String),
}

impl AnalyzerError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        AnalyzerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub trait Analyzer: Send + Sync {
    /// Registry name, e.g. `licenses`.
    fn name(&self) -> &'static str;

    fn scan(
        &self,
        location: &Path,
        deadline: Deadline,
        options: &AnalyzerOptions,
    ) -> Result<AttributeMapping, AnalyzerError>;
}

/// Analyzers by name.
#[derive(Clone, Default)]
pub struct AnalyzerRegistry {
    analyzers: BTreeMap<String, Arc<dyn Analyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `file_info`, `licenses` and `copyrights`.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(FileInfoAnalyzer);
        registry.register(LicenseAnalyzer::new());
        registry.register(CopyrightAnalyzer::new());
        registry
    }

    pub fn register<A: Analyzer + 'static>(&mut self, analyzer: A) -> &mut Self {
        self.register_arc(Arc::new(analyzer))
    }

    /// Register under the analyzer's own name, replacing any previous entry.
    pub fn register_arc(&mut self, analyzer: Arc<dyn Analyzer>) -> &mut Self {
        self.analyzers.insert(analyzer.name().to_string(), analyzer);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Analyzer>> {
        self.analyzers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.analyzers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.analyzers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for AnalyzerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerRegistry")
            .field("analyzers", &self.names())
            .finish()
    }
}

/// Read at most `max_bytes` from the head of a file.
pub(crate) fn read_head(path: &Path, max_bytes: u64) -> Result<Vec<u8>, AnalyzerError> {
    let file = File::open(path).map_err(|e| AnalyzerError::io(path, e))?;
    let mut buf = Vec::new();
    file.take(max_bytes)
        .read_to_end(&mut buf)
        .map_err(|e| AnalyzerError::io(path, e))?;
    Ok(buf)
}

/// Strip comment leaders and trailers so statement regexes see prose.
pub(crate) fn strip_comment_markers(line: &str) -> &str {
    let mut text = line.trim();
    for leader in ["/**", "/*", "<!--", "//", "#", "*", ";;", "--", "%", "'"] {
        if let Some(rest) = text.strip_prefix(leader) {
            text = rest.trim_start();
            break;
        }
    }
    for trailer in ["*/", "-->"] {
        if let Some(rest) = text.strip_suffix(trailer) {
            text = rest.trim_end();
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_registry_names() {
        let registry = AnalyzerRegistry::builtin();
        assert_eq!(registry.names(), vec!["copyrights", "file_info", "licenses"]);
        assert!(registry.get("licenses").is_some());
        assert!(registry.get("packages").is_none());
    }

    #[test]
    fn test_read_head_caps_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[b'a'; 100]).unwrap();
        let head = read_head(file.path(), 10).unwrap();
        assert_eq!(head.len(), 10);
    }

    #[test]
    fn test_read_head_missing_file() {
        let err = read_head(Path::new("/definitely/not/here"), 10).unwrap_err();
        assert!(matches!(err, AnalyzerError::Io { .. }));
    }

    #[test]
    fn test_strip_comment_markers() {
        assert_eq!(strip_comment_markers("  // Copyright 2020 Foo"), "Copyright 2020 Foo");
        assert_eq!(strip_comment_markers(" * @author Jane"), "@author Jane");
        assert_eq!(strip_comment_markers("/* MIT */"), "MIT");
        assert_eq!(strip_comment_markers("#  Licensed under"), "Licensed under");
        assert_eq!(strip_comment_markers("<!-- x -->"), "x");
    }
}
