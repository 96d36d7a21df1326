//! In-memory resource tree for one scan.
//!
//! Resources are keyed by their path relative to the scan root's parent and
//! kept in path order, so a parent always precedes its children.

use crate::ignore::IgnorePredicate;
use crate::tree::{scan_relative_path, walk};
use chrono::{DateTime, Utc};
use scanservice_protocol::defaults::{HEADER_NOTICE, OUTPUT_FORMAT_VERSION, TOOL_NAME};
use scanservice_protocol::ResourceAttributes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CodebaseError {
    #[error("Failed to read scan root {}: {source}", .path.display())]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Scan root name is not valid UTF-8: {}", .0.display())]
    NonUtf8Root(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    File,
    Directory,
}

/// One file or directory of the scanned tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ResourceType,
    pub name: String,
    pub base_name: String,
    pub extension: String,
    pub size: u64,
    pub files_count: u64,
    pub dirs_count: u64,
    pub size_count: u64,
    #[serde(flatten)]
    pub attributes: ResourceAttributes,
}

impl Resource {
    fn new(path: String, kind: ResourceType, size: u64) -> Self {
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        let (base_name, extension) = match kind {
            ResourceType::Directory => (name.clone(), String::new()),
            ResourceType::File => split_extension(&name),
        };
        Self {
            path,
            kind,
            name,
            base_name,
            extension,
            size,
            files_count: 0,
            dirs_count: 0,
            size_count: 0,
            attributes: ResourceAttributes::default(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == ResourceType::File
    }

    pub fn parent_path(&self) -> Option<&str> {
        self.path.rsplit_once('/').map(|(parent, _)| parent)
    }
}

/// `archive.tar.gz` splits as (`archive.tar`, `.gz`); dotfiles have no
/// extension.
fn split_extension(name: &str) -> (String, String) {
    match name.rfind('.') {
        Some(0) | None => (name.to_string(), String::new()),
        Some(idx) => (name[..idx].to_string(), name[idx..].to_string()),
    }
}

/// File, directory and byte totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub files: u64,
    pub dirs: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderOptions {
    pub base: String,
    pub output_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEnvironment {
    pub operating_system: String,
    pub cpu_architecture: String,
    pub platform: String,
    pub os_family: String,
}

impl SystemEnvironment {
    pub fn current() -> Self {
        Self {
            operating_system: std::env::consts::OS.to_string(),
            cpu_architecture: std::env::consts::ARCH.to_string(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            os_family: std::env::consts::FAMILY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderExtraData {
    pub system_environment: SystemEnvironment,
    pub files_count: u64,
    /// `initial:files_count`, `final:size_count` and so on.
    pub counters: BTreeMap<String, u64>,
}

/// Run metadata written at the top of the output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodebaseHeader {
    pub tool_name: String,
    pub tool_version: String,
    pub options: HeaderOptions,
    pub notice: String,
    pub start_timestamp: String,
    pub end_timestamp: String,
    pub output_format_version: String,
    pub duration: f64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub extra_data: HeaderExtraData,
}

/// Values recorded when a run finishes.
#[derive(Debug, Clone)]
pub struct HeaderUpdate {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration: Duration,
    pub options: HeaderOptions,
}

/// Where a codebase-level detection was first seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMatch {
    pub license_expression: String,
    pub license_expression_spdx: String,
    pub from_file: String,
    pub start_line: u32,
    pub end_line: u32,
    pub matcher: String,
    pub score: f64,
    pub rule_identifier: String,
}

/// A license detection aggregated over the whole codebase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueDetection {
    pub identifier: String,
    pub license_expression: String,
    pub license_expression_spdx: String,
    pub detection_count: u64,
    pub reference_matches: Vec<ReferenceMatch>,
}

/// Serialized form of a finished codebase.
#[derive(Debug, Serialize)]
pub struct ScanDocument<'a> {
    pub headers: Vec<&'a CodebaseHeader>,
    pub license_detections: &'a [UniqueDetection],
    pub files: Vec<&'a Resource>,
}

pub struct Codebase {
    root: PathBuf,
    root_path: String,
    resources: BTreeMap<String, Resource>,
    /// License expression to the paths that carry it.
    license_index: BTreeMap<String, BTreeSet<String>>,
    header: CodebaseHeader,
    license_detections: Vec<UniqueDetection>,
}

impl std::fmt::Debug for Codebase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codebase")
            .field("root", &self.root)
            .field("resources", &self.resources.len())
            .finish()
    }
}

impl Codebase {
    /// Build the tree for `root`, a file or a directory. Entries the
    /// predicate ignores are left out, the same way the producer leaves them
    /// out.
    pub fn build(root: &Path, ignore: Arc<dyn IgnorePredicate>) -> Result<Self, CodebaseError> {
        let root_meta = std::fs::metadata(root).map_err(|source| CodebaseError::Root {
            path: root.to_path_buf(),
            source,
        })?;
        let root_path = scan_relative_path(root, root)
            .ok_or_else(|| CodebaseError::NonUtf8Root(root.to_path_buf()))?;
        let mut resources = BTreeMap::new();
        let mut errors = Vec::new();

        if root_meta.is_file() {
            resources.insert(
                root_path.clone(),
                Resource::new(root_path.clone(), ResourceType::File, root_meta.len()),
            );
        } else {
            for entry in walk(root.to_path_buf(), ignore) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                        continue;
                    }
                };
                let file_type = entry.file_type();
                let kind = if file_type.is_dir() {
                    ResourceType::Directory
                } else if file_type.is_file() {
                    ResourceType::File
                } else {
                    debug!(path = %entry.path().display(), "Skipping non-regular entry");
                    continue;
                };
                let size = match kind {
                    ResourceType::File => entry.metadata().map(|m| m.len()).unwrap_or(0),
                    ResourceType::Directory => 0,
                };
                let Some(path) = scan_relative_path(root, entry.path()) else {
                    warn!(path = %entry.path().display(), "Skipping entry whose path is not valid UTF-8");
                    errors.push(format!(
                        "Path is not valid UTF-8: {}",
                        entry.path().display()
                    ));
                    continue;
                };
                resources.insert(path.clone(), Resource::new(path, kind, size));
            }
        }

        let mut codebase = Self {
            root: root.to_path_buf(),
            root_path,
            resources,
            license_index: BTreeMap::new(),
            header: CodebaseHeader {
                errors,
                ..Default::default()
            },
            license_detections: Vec::new(),
        };
        codebase.compute_directory_counts();
        debug!(
            root = %codebase.root.display(),
            resources = codebase.resources.len(),
            "Built codebase"
        );
        Ok(codebase)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative path of the root resource.
    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Resource> {
        self.resources.get(path)
    }

    /// Store a modified resource and refresh the license index. Only known
    /// paths can be saved.
    pub fn save(&mut self, resource: Resource) -> Result<(), CodebaseError> {
        let Some(slot) = self.resources.get_mut(&resource.path) else {
            return Err(CodebaseError::ResourceNotFound(resource.path));
        };
        let old_expression = std::mem::take(&mut slot.attributes.detected_license_expression);
        *slot = resource;

        if !old_expression.is_empty() {
            if let Some(paths) = self.license_index.get_mut(&old_expression) {
                paths.remove(&slot.path);
                if paths.is_empty() {
                    self.license_index.remove(&old_expression);
                }
            }
        }
        let expression = &slot.attributes.detected_license_expression;
        if !expression.is_empty() {
            self.license_index
                .entry(expression.clone())
                .or_default()
                .insert(slot.path.clone());
        }
        Ok(())
    }

    /// All resources, parents before children.
    pub fn walk(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn files(&self) -> impl Iterator<Item = &Resource> {
        self.walk().filter(|r| r.is_file())
    }

    /// Paths whose detected expression is exactly `expression`.
    pub fn paths_with_license(&self, expression: &str) -> impl Iterator<Item = &str> {
        self.license_index
            .get(expression)
            .into_iter()
            .flat_map(|paths| paths.iter().map(String::as_str))
    }

    pub fn compute_counts(&self) -> Counts {
        self.walk().fold(Counts::default(), |mut counts, resource| {
            match resource.kind {
                ResourceType::File => {
                    counts.files += 1;
                    counts.size += resource.size;
                }
                ResourceType::Directory => counts.dirs += 1,
            }
            counts
        })
    }

    pub fn save_initial_counts(&mut self) {
        self.save_counts("initial");
    }

    pub fn save_final_counts(&mut self) {
        self.save_counts("final");
    }

    fn save_counts(&mut self, phase: &str) {
        let counts = self.compute_counts();
        let counters = &mut self.header.extra_data.counters;
        counters.insert(format!("{}:files_count", phase), counts.files);
        counters.insert(format!("{}:dirs_count", phase), counts.dirs);
        counters.insert(format!("{}:size_count", phase), counts.size);
    }

    /// Descendant file, directory and byte totals for every directory.
    fn compute_directory_counts(&mut self) {
        let mut totals: BTreeMap<String, Counts> = BTreeMap::new();
        for resource in self.resources.values() {
            let mut ancestor = resource.parent_path();
            while let Some(parent) = ancestor {
                if !self.resources.contains_key(parent) {
                    break;
                }
                let entry = totals.entry(parent.to_string()).or_default();
                match resource.kind {
                    ResourceType::File => {
                        entry.files += 1;
                        entry.size += resource.size;
                    }
                    ResourceType::Directory => entry.dirs += 1,
                }
                ancestor = parent.rsplit_once('/').map(|(p, _)| p);
            }
        }
        for (path, counts) in totals {
            if let Some(dir) = self.resources.get_mut(&path) {
                dir.files_count = counts.files;
                dir.dirs_count = counts.dirs;
                dir.size_count = counts.size;
            }
        }
    }

    pub fn header(&self) -> &CodebaseHeader {
        &self.header
    }

    /// Record run metadata and final counts.
    pub fn update_header(&mut self, update: HeaderUpdate) {
        self.save_final_counts();
        let files_count = self.compute_counts().files;
        let header = &mut self.header;
        header.tool_name = TOOL_NAME.to_string();
        header.tool_version = env!("CARGO_PKG_VERSION").to_string();
        header.output_format_version = OUTPUT_FORMAT_VERSION.to_string();
        header.notice = HEADER_NOTICE.to_string();
        header.start_timestamp = format_timestamp(update.start);
        header.end_timestamp = format_timestamp(update.end);
        header.duration = update.duration.as_secs_f64();
        header.options = update.options;
        header.extra_data.system_environment = SystemEnvironment::current();
        header.extra_data.files_count = files_count;
    }

    pub fn license_detections(&self) -> &[UniqueDetection] {
        &self.license_detections
    }

    /// Aggregate per-file detections by identifier, first occurrence first.
    pub fn collect_license_detections(&mut self) {
        let mut unique: Vec<UniqueDetection> = Vec::new();
        let mut positions: BTreeMap<String, usize> = BTreeMap::new();

        for resource in self.resources.values().filter(|r| r.is_file()) {
            for detection in &resource.attributes.license_detections {
                if let Some(&idx) = positions.get(&detection.identifier) {
                    unique[idx].detection_count += 1;
                    continue;
                }
                positions.insert(detection.identifier.clone(), unique.len());
                unique.push(UniqueDetection {
                    identifier: detection.identifier.clone(),
                    license_expression: detection.license_expression.clone(),
                    license_expression_spdx: detection.license_expression_spdx.clone(),
                    detection_count: 1,
                    reference_matches: detection
                        .matches
                        .iter()
                        .map(|m| ReferenceMatch {
                            license_expression: m.license_expression.clone(),
                            license_expression_spdx: m.license_expression_spdx.clone(),
                            from_file: resource.path.clone(),
                            start_line: m.start_line,
                            end_line: m.end_line,
                            matcher: m.matcher.clone(),
                            score: m.score,
                            rule_identifier: m.rule_identifier.clone(),
                        })
                        .collect(),
                });
            }
        }
        self.license_detections = unique;
    }

    pub fn document(&self) -> ScanDocument<'_> {
        ScanDocument {
            headers: vec![&self.header],
            license_detections: &self.license_detections,
            files: self.walk().collect(),
        }
    }
}

/// `2024-05-01T101500.123456`
fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H%M%S%.6f").to_string()
}
