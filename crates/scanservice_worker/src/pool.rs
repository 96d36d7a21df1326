//! Fixed-size pool of analyzer slots.
//!
//! Slots pull jobs from one shared queue, one job at a time. A slot runs its
//! job either on the blocking thread pool (in-process backend) or in its own
//! child process (process backend).
//!
//! Shutdown policy: refuse new calls, stop idle slots, fail every queued but
//! unstarted call with [`PoolError::Cancelled`], then wait for running calls
//! to finish before tearing workers down. Running calls are never
//! interrupted.

use crate::analyzer::AnalyzerRegistry;
use crate::process::{ProcessConfig, WorkerProcess};
use scanservice_protocol::{
    AnalyzerCall, AttributeMapping, FailureKind, FailurePayload, OpCode,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("Worker pool is shut down")]
    ShutDown,

    #[error("Call cancelled before it started")]
    Cancelled,

    #[error("Unknown analyzer: {0}")]
    UnknownAnalyzer(String),

    #[error("Analyzer '{analyzer}' failed: {message}")]
    Analyzer { analyzer: String, message: String },

    #[error("Worker crashed while running '{analyzer}': {message}")]
    WorkerCrashed { analyzer: String, message: String },

    #[error("Failed to start worker: {0}")]
    Spawn(String),
}

/// Where a slot runs its calls.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Blocking thread pool of this process.
    InProcess(AnalyzerRegistry),
    /// One child process per slot.
    Process(ProcessConfig),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub backend: Backend,
}

impl PoolConfig {
    pub fn in_process(size: usize, registry: AnalyzerRegistry) -> Self {
        Self {
            size,
            backend: Backend::InProcess(registry),
        }
    }

    pub fn process(size: usize, config: ProcessConfig) -> Self {
        Self {
            size,
            backend: Backend::Process(config),
        }
    }
}

/// Counters since the pool started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub completed: u64,
    pub failed: u64,
    pub crashed: u64,
    pub skipped: u64,
    pub cancelled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    crashed: AtomicU64,
    skipped: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn record(&self, result: &Result<AttributeMapping, PoolError>) {
        let counter = match result {
            Ok(_) => &self.completed,
            Err(PoolError::WorkerCrashed { .. }) => &self.crashed,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            crashed: self.crashed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

type Reply = Result<AttributeMapping, PoolError>;

struct Job {
    call: AnalyzerCall,
    reply: oneshot::Sender<Reply>,
}

/// A call accepted by the pool. Dropping it before a slot picks the call
/// up makes the pool skip the call.
pub struct PendingCall {
    reply: oneshot::Receiver<Reply>,
}

impl PendingCall {
    pub async fn wait(self) -> Reply {
        self.reply.await.unwrap_or(Err(PoolError::Cancelled))
    }
}

/// Handle to the pool. Clones share the same slots.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

struct Inner {
    size: usize,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    queue: Arc<AsyncMutex<mpsc::UnboundedReceiver<Job>>>,
    stopping: CancellationToken,
    slots: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerPool {
    /// Start `config.size` slots (at least one). Must be called inside a
    /// tokio runtime.
    pub fn start(config: PoolConfig) -> Self {
        let size = config.size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Arc::new(AsyncMutex::new(receiver));
        let stopping = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let slots = (0..size)
            .map(|index| {
                let slot = match &config.backend {
                    Backend::InProcess(registry) => Slot::InProcess(registry.clone()),
                    Backend::Process(process) => Slot::Process {
                        config: process.clone(),
                        worker: None,
                    },
                };
                tokio::spawn(run_slot(
                    index,
                    slot,
                    Arc::clone(&queue),
                    stopping.clone(),
                    Arc::clone(&counters),
                ))
            })
            .collect();

        info!(
            size,
            backend = config.backend.label(),
            "Worker pool started"
        );

        Self {
            inner: Arc::new(Inner {
                size,
                sender: Mutex::new(Some(sender)),
                queue,
                stopping,
                slots: Mutex::new(slots),
                counters,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Enqueue a call without waiting for it.
    pub fn submit(&self, call: AnalyzerCall) -> Result<PendingCall, PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sender = lock(&self.inner.sender);
        let sender = sender.as_ref().ok_or(PoolError::ShutDown)?;
        sender
            .send(Job {
                call,
                reply: reply_tx,
            })
            .map_err(|_| PoolError::ShutDown)?;
        Ok(PendingCall { reply: reply_rx })
    }

    /// Enqueue a call and wait for its result.
    pub async fn call(&self, call: AnalyzerCall) -> Reply {
        self.submit(call)?.wait().await
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.counters.snapshot()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.stopping.is_cancelled()
    }

    /// Stop the pool. Safe to call more than once.
    pub async fn shutdown(&self) -> PoolStats {
        self.inner.stopping.cancel();
        drop(lock(&self.inner.sender).take());

        let mut cancelled = 0u64;
        {
            let mut queue = self.inner.queue.lock().await;
            queue.close();
            while let Ok(job) = queue.try_recv() {
                cancelled += 1;
                let _ = job.reply.send(Err(PoolError::Cancelled));
            }
        }
        self.inner
            .counters
            .cancelled
            .fetch_add(cancelled, Ordering::Relaxed);

        let slots = std::mem::take(&mut *lock(&self.inner.slots));
        if !slots.is_empty() {
            info!(
                cancelled,
                "Worker pool stopping, waiting for running calls"
            );
        }
        for (index, handle) in slots.into_iter().enumerate() {
            if let Err(e) = handle.await {
                warn!("Pool slot {} panicked during shutdown: {:?}", index, e);
            }
        }

        let stats = self.stats();
        debug!(?stats, "Worker pool stopped");
        stats
    }
}

impl Backend {
    fn label(&self) -> &'static str {
        match self {
            Backend::InProcess(_) => "in-process",
            Backend::Process(_) => "process",
        }
    }
}

enum Slot {
    InProcess(AnalyzerRegistry),
    Process {
        config: ProcessConfig,
        worker: Option<WorkerProcess>,
    },
}

impl Slot {
    async fn execute(&mut self, call: AnalyzerCall) -> Reply {
        match self {
            Slot::InProcess(registry) => execute_in_process(registry, call).await,
            Slot::Process { config, worker } => execute_in_child(config, worker, call).await,
        }
    }

    async fn teardown(self) {
        if let Slot::Process {
            worker: Some(worker),
            ..
        } = self
        {
            worker.shutdown().await;
        }
    }
}

async fn run_slot(
    index: usize,
    mut slot: Slot,
    queue: Arc<AsyncMutex<mpsc::UnboundedReceiver<Job>>>,
    stopping: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        let job = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = stopping.cancelled() => None,
                job = queue.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        if job.reply.is_closed() {
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(
                slot = index,
                analyzer = %job.call.analyzer,
                path = %job.call.location.display(),
                "Skipping call whose caller is gone"
            );
            continue;
        }

        let result = slot.execute(job.call).await;
        counters.record(&result);
        let _ = job.reply.send(result);
    }

    slot.teardown().await;
    debug!(slot = index, "Pool slot stopped");
}

async fn execute_in_process(registry: &AnalyzerRegistry, call: AnalyzerCall) -> Reply {
    let analyzer = registry
        .get(&call.analyzer)
        .ok_or_else(|| PoolError::UnknownAnalyzer(call.analyzer.clone()))?;
    let name = call.analyzer.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        analyzer.scan(&call.location, call.deadline, &call.options)
    })
    .await;

    match outcome {
        Ok(Ok(mapping)) => Ok(mapping),
        Ok(Err(e)) => Err(PoolError::Analyzer {
            analyzer: name,
            message: e.to_string(),
        }),
        Err(e) => Err(PoolError::WorkerCrashed {
            analyzer: name,
            message: panic_message(e),
        }),
    }
}

async fn execute_in_child(
    config: &ProcessConfig,
    worker: &mut Option<WorkerProcess>,
    call: AnalyzerCall,
) -> Reply {
    if worker.is_none() {
        let spawned =
            WorkerProcess::spawn(config).map_err(|e| PoolError::Spawn(e.to_string()))?;
        *worker = Some(spawned);
    }
    let Some(process) = worker.as_mut() else {
        return Err(PoolError::Spawn("worker process unavailable".to_string()));
    };

    let frame = match process.roundtrip(&call).await {
        Ok(frame) => frame,
        Err(e) => {
            warn!(
                analyzer = %call.analyzer,
                path = %call.location.display(),
                "Worker process failed mid-call, respawning on next use: {}",
                e
            );
            if let Some(mut dead) = worker.take() {
                dead.kill().await;
            }
            return Err(PoolError::WorkerCrashed {
                analyzer: call.analyzer,
                message: e.to_string(),
            });
        }
    };

    match frame.opcode() {
        OpCode::Result => frame
            .decode::<AttributeMapping>()
            .map_err(|e| PoolError::WorkerCrashed {
                analyzer: call.analyzer,
                message: format!("undecodable reply: {}", e),
            }),
        OpCode::Failed => {
            let failure: FailurePayload =
                frame.decode().map_err(|e| PoolError::WorkerCrashed {
                    analyzer: call.analyzer.clone(),
                    message: format!("undecodable failure: {}", e),
                })?;
            Err(match failure.kind {
                FailureKind::UnknownAnalyzer => PoolError::UnknownAnalyzer(failure.analyzer),
                FailureKind::Analyzer => PoolError::Analyzer {
                    analyzer: failure.analyzer,
                    message: failure.message,
                },
            })
        }
        OpCode::Call => Err(PoolError::WorkerCrashed {
            analyzer: call.analyzer,
            message: "worker replied with a call frame".to_string(),
        }),
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
