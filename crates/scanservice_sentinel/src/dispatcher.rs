//! Dispatcher: drives one scan task from work items to the written output.
//!
//! Every work item fans out to each configured analyzer on the pool, the
//! per-item outputs are combined in analyzer order, and the combination is
//! merged through the [`MergeActor`]. The first failing item aborts the
//! task; merges already applied are kept.

use crate::codebase::{Codebase, CodebaseError, HeaderOptions, HeaderUpdate};
use crate::ignore::IgnorePredicate;
use crate::merge::{MergeActor, MergeError, MergeHandle, MergeOutcome};
use crate::output::{OutputError, OutputWriter, WriteReport};
use crate::producer::{WorkItem, WorkItemProducer};
use crate::task::ScanTask;
use chrono::Utc;
use scanservice_protocol::defaults::{DEFAULT_ANALYZERS, DEFAULT_DELTA_T_SECS, DEFAULT_PROCESSES};
use scanservice_protocol::{combine, AnalyzerCall, AnalyzerOptions, Deadline, TaskId};
use scanservice_worker::{PoolError, WorkerPool};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-file deadline offset.
    pub delta_t: Duration,
    /// Analyzers in combine order. Later outputs win on shared keys.
    pub analyzers: Vec<String>,
    pub options: AnalyzerOptions,
    /// Most work items pending at once.
    pub max_in_flight: usize,
}

impl DispatcherConfig {
    /// Defaults sized for a pool of `pool_size` workers.
    pub fn for_pool(pool_size: usize) -> Self {
        Self {
            delta_t: Duration::from_secs(DEFAULT_DELTA_T_SECS),
            analyzers: DEFAULT_ANALYZERS.iter().map(|a| a.to_string()).collect(),
            options: AnalyzerOptions::default(),
            max_in_flight: 4 * pool_size.max(1),
        }
    }

    pub fn with_analyzers<I, S>(mut self, analyzers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.analyzers = analyzers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delta_t(mut self, delta_t: Duration) -> Self {
        self.delta_t = delta_t;
        self
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::for_pool(DEFAULT_PROCESSES)
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to build codebase: {0}")]
    Codebase(#[from] CodebaseError),

    #[error("Failed to scan {path}: {source}")]
    Analyzer {
        path: String,
        #[source]
        source: PoolError,
    },

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("Scan task failed to complete: {0}")]
    Join(String),
}

/// What one successful run did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub task_id: TaskId,
    pub files: u64,
    pub merged: u64,
    /// Merges whose target resource was missing.
    pub not_found: u64,
    pub elapsed: Duration,
    pub report: WriteReport,
}

#[derive(Debug, Default)]
struct Tally {
    files: u64,
    merged: u64,
    not_found: u64,
}

impl Tally {
    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Applied { .. } => self.merged += 1,
            MergeOutcome::NotFound => self.not_found += 1,
        }
    }
}

pub struct Dispatcher {
    pool: WorkerPool,
    writer: OutputWriter,
    ignore: Arc<dyn IgnorePredicate>,
    config: Arc<DispatcherConfig>,
}

impl Dispatcher {
    pub fn new(
        pool: WorkerPool,
        writer: OutputWriter,
        ignore: Arc<dyn IgnorePredicate>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            pool,
            writer,
            ignore,
            config: Arc::new(config),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn writer(&self) -> &OutputWriter {
        &self.writer
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Scan `task.root` and write the result to `task.output`.
    pub async fn run(&self, task: &ScanTask) -> Result<RunSummary, DispatchError> {
        let start = Utc::now();
        let started = Instant::now();

        let root = task.root.clone();
        let ignore = Arc::clone(&self.ignore);
        let mut codebase = tokio::task::spawn_blocking(move || Codebase::build(&root, ignore))
            .await
            .map_err(|e| DispatchError::Join(e.to_string()))??;
        codebase.save_initial_counts();
        debug!(
            task_id = %task.id,
            resources = codebase.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Codebase built"
        );

        let actor = MergeActor::open(codebase).await?;
        let scan_started = Instant::now();
        let fanned_out = self.fan_out(task, actor.handle()).await;
        let closed = actor.close().await;
        let tally = fanned_out?;
        let mut codebase = closed?;
        info!(
            task_id = %task.id,
            files = tally.files,
            not_found = tally.not_found,
            elapsed_ms = scan_started.elapsed().as_millis() as u64,
            "Scan finished"
        );

        codebase.collect_license_detections();
        codebase.update_header(HeaderUpdate {
            start,
            end: Utc::now(),
            duration: started.elapsed(),
            options: HeaderOptions {
                base: task.root.display().to_string(),
                output_file: task.output.display().to_string(),
            },
        });
        let report = self.writer.write(codebase, task.output.clone()).await?;

        Ok(RunSummary {
            task_id: task.id,
            files: tally.files,
            merged: tally.merged,
            not_found: tally.not_found,
            elapsed: started.elapsed(),
            report,
        })
    }

    /// Run every work item, at most `max_in_flight` at once. Returns on the
    /// first failure; dropping the join set aborts the remaining items.
    async fn fan_out(&self, task: &ScanTask, merges: MergeHandle) -> Result<Tally, DispatchError> {
        let limit = self.config.max_in_flight.max(1);
        let mut items =
            WorkItemProducer::new(task, Arc::clone(&self.ignore)).into_stream(limit);
        let mut in_flight = JoinSet::new();
        let mut tally = Tally::default();
        let mut exhausted = false;

        loop {
            tokio::select! {
                biased;

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    let outcome = joined.map_err(|e| DispatchError::Join(e.to_string()))??;
                    tally.record(outcome);
                }

                item = items.recv(), if !exhausted && in_flight.len() < limit => {
                    match item {
                        Some(item) => {
                            tally.files += 1;
                            in_flight.spawn(scan_item(
                                self.pool.clone(),
                                merges.clone(),
                                Arc::clone(&self.config),
                                item,
                            ));
                        }
                        None => exhausted = true,
                    }
                }

                else => break,
            }
        }
        Ok(tally)
    }
}

/// Analyze one item with every configured analyzer and merge the result.
async fn scan_item(
    pool: WorkerPool,
    merges: MergeHandle,
    config: Arc<DispatcherConfig>,
    item: WorkItem,
) -> Result<MergeOutcome, DispatchError> {
    let failed = |source: PoolError| DispatchError::Analyzer {
        path: item.relative_path.clone(),
        source,
    };
    let deadline = Deadline::after(config.delta_t);

    let pending = config
        .analyzers
        .iter()
        .map(|analyzer| {
            pool.submit(AnalyzerCall {
                analyzer: analyzer.clone(),
                location: item.location.clone(),
                deadline,
                options: config.options.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(failed)?;

    let mut outputs = Vec::with_capacity(pending.len());
    for call in pending {
        outputs.push(call.wait().await.map_err(failed)?);
    }

    let outcome = merges
        .submit(item.relative_path.clone(), combine(outputs))
        .await?;
    Ok(outcome)
}
