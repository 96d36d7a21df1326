//! Scan orchestration for the scan service.
//!
//! - [`producer`]: root path to a lazy stream of [`WorkItem`]s
//! - [`dispatcher`]: per-task fan-out against the [`WorkerPool`](scanservice_worker::WorkerPool)
//! - [`merge`]: the single-writer [`MergeActor`] over the [`Codebase`]
//! - [`output`]: atomic JSON output on dedicated I/O threads
//! - [`registry`]: task status tracking with grace-period expiry
//! - [`api`]: axum routes over a [`ScanService`]

pub mod api;
pub mod codebase;
pub mod dispatcher;
pub mod ignore;
pub mod merge;
pub mod output;
pub mod producer;
pub mod registry;
pub mod service;
pub mod task;
pub mod tree;

pub use api::{router, ApiError};
pub use codebase::{Codebase, CodebaseError, CodebaseHeader, Resource, ResourceType};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherConfig, RunSummary};
pub use ignore::{IgnorePredicate, IgnoreRules, DEFAULT_IGNORE_PATTERNS};
pub use merge::{MergeActor, MergeError, MergeHandle, MergeOutcome};
pub use output::{OutputError, OutputWriter, WriteReport};
pub use producer::{WorkItem, WorkItemProducer, WorkItems};
pub use registry::{RegistryError, TaskOutcome, TaskRegistry};
pub use service::ScanService;
pub use task::{RootKind, ScanTask, SubmitError};
