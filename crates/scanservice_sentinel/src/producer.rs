//! Work item producer: one root path in, one work item per scanned file out.

use crate::ignore::IgnorePredicate;
use crate::task::{RootKind, ScanTask};
use crate::tree::{scan_relative_path, walk};
use scanservice_protocol::TaskId;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One file to analyze.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub task_id: TaskId,
    /// Absolute location on disk.
    pub location: PathBuf,
    /// Path relative to the scan root's parent, `/`-separated.
    pub relative_path: String,
}

/// Single-use producer for one task.
pub struct WorkItemProducer {
    task_id: TaskId,
    root: PathBuf,
    kind: RootKind,
    ignore: Arc<dyn IgnorePredicate>,
}

impl WorkItemProducer {
    pub fn new(task: &ScanTask, ignore: Arc<dyn IgnorePredicate>) -> Self {
        Self {
            task_id: task.id,
            root: task.root.clone(),
            kind: task.kind,
            ignore,
        }
    }

    /// Blocking iterator over the work items. Performs filesystem I/O.
    pub fn into_items(self) -> WorkItems {
        let source = match self.kind {
            RootKind::File => Source::Single(Some(self.root.clone())),
            RootKind::Directory => {
                Source::Walk(Box::new(walk(self.root.clone(), Arc::clone(&self.ignore))))
            }
        };
        WorkItems {
            task_id: self.task_id,
            root: self.root,
            source,
            produced: 0,
        }
    }

    /// Run the walk on the blocking pool and feed a bounded channel.
    ///
    /// Dropping the receiver stops the walk at the next item.
    pub fn into_stream(self, capacity: usize) -> mpsc::Receiver<WorkItem> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::task::spawn_blocking(move || {
            for item in self.into_items() {
                if tx.blocking_send(item).is_err() {
                    debug!("Work item receiver dropped, stopping walk");
                    break;
                }
            }
        });
        rx
    }
}

type WalkIter = Box<dyn Iterator<Item = walkdir::Result<walkdir::DirEntry>> + Send>;

enum Source {
    Single(Option<PathBuf>),
    Walk(WalkIter),
}

pub struct WorkItems {
    task_id: TaskId,
    root: PathBuf,
    source: Source,
    produced: u64,
}

impl WorkItems {
    /// Items produced so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }
}

impl Iterator for WorkItems {
    type Item = WorkItem;

    fn next(&mut self) -> Option<WorkItem> {
        loop {
            let location = match &mut self.source {
                Source::Single(path) => path.take()?,
                Source::Walk(entries) => match entries.next()? {
                    Ok(entry) if entry.file_type().is_file() => entry.into_path(),
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Skipping unreadable entry: {}", e);
                        continue;
                    }
                },
            };
            let Some(relative_path) = scan_relative_path(&self.root, &location) else {
                warn!(path = %location.display(), "Skipping file whose path is not valid UTF-8");
                continue;
            };
            self.produced += 1;
            return Some(WorkItem {
                task_id: self.task_id,
                location,
                relative_path,
            });
        }
    }
}
