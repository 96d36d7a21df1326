//! Scan service worker: content analyzers and the pool that runs them.
//!
//! - [`analyzer`]: the [`Analyzer`] trait and the built-in analyzers
//! - [`pool`]: fixed-size [`WorkerPool`] with in-process and process backends
//! - [`process`]: parent side of a worker child process
//! - [`runtime`]: child side, the `scanservice worker` loop

pub mod analyzer;
pub mod pool;
pub mod process;
pub mod runtime;

pub use analyzer::{Analyzer, AnalyzerError, AnalyzerRegistry};
pub use pool::{Backend, PendingCall, PoolConfig, PoolError, PoolStats, WorkerPool};
pub use process::{ProcessConfig, ProcessError, WorkerProcess};
