//! Scan service: accepts scan requests and runs them in the background.

use crate::dispatcher::Dispatcher;
use crate::registry::{TaskOutcome, TaskRegistry};
use crate::task::{ScanTask, SubmitError};
use scanservice_protocol::{ScanAccepted, ScanRequest};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Shared by the HTTP handlers. Clones share the dispatcher and registry.
#[derive(Clone)]
pub struct ScanService {
    dispatcher: Arc<Dispatcher>,
    registry: TaskRegistry,
}

impl ScanService {
    pub fn new(dispatcher: Dispatcher, registry: TaskRegistry) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            registry,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Validate the request, register the task and start it. Returns as
    /// soon as the task is registered.
    pub fn submit(&self, request: ScanRequest) -> Result<ScanAccepted, SubmitError> {
        if self.dispatcher.pool().is_shut_down() {
            return Err(SubmitError::ShuttingDown);
        }
        let task = ScanTask::new(&request.scan_path, request.output_file.clone())?;
        let id = task.id;

        // The run waits for `start` so it cannot complete before it is
        // registered.
        let (start_tx, start_rx) = oneshot::channel::<()>();
        let dispatcher = Arc::clone(&self.dispatcher);
        let registry = self.registry.clone();
        let run_task = task.clone();
        let handle = tokio::spawn(async move {
            if start_rx.await.is_err() {
                return;
            }
            let outcome = match dispatcher.run(&run_task).await {
                Ok(summary) => {
                    info!(
                        task_id = %summary.task_id,
                        files = summary.files,
                        bytes = summary.report.bytes,
                        elapsed_ms = summary.elapsed.as_millis() as u64,
                        "Scan task done"
                    );
                    TaskOutcome::Done
                }
                Err(e) => {
                    error!(task_id = %run_task.id, "Scan task failed: {}", e);
                    TaskOutcome::Failed(e.to_string())
                }
            };
            registry.complete(run_task.id, outcome);
        });

        info!(
            task_id = %id,
            root = %task.root.display(),
            kind = task.kind.as_str(),
            output = %task.output.display(),
            "Scan task submitted"
        );
        self.registry.register(task, handle.abort_handle());
        if start_tx.send(()).is_err() {
            warn!(task_id = %id, "Scan task exited before it started");
        }

        Ok(ScanAccepted {
            scan_path: request.scan_path,
            output_file: request.output_file,
            uuid: id,
        })
    }

    /// Cancel pending scans and stop the pool and the writer.
    pub async fn shutdown(&self) {
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            info!(cancelled, "Cancelled pending scans");
        }
        let stats = self.dispatcher.pool().shutdown().await;
        self.dispatcher.writer().shutdown().await;
        info!(
            completed = stats.completed,
            failed = stats.failed,
            crashed = stats.crashed,
            "Scan service stopped"
        );
    }
}
