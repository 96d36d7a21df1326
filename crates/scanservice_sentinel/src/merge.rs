//! Merge actor: the single writer of a [`Codebase`] while a scan runs.
//!
//! The codebase moves onto a dedicated OS thread running its own
//! current-thread runtime. Callers reach it only through an unbounded
//! mailbox, which is drained strictly in order, so merges never interleave.

use crate::codebase::{Codebase, CodebaseError};
use scanservice_protocol::AttributeMapping;
use std::future::Future;
use std::thread;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// What a merge request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Fields that were overwritten. Empty when every incoming value was
    /// falsy.
    Applied { fields: Vec<&'static str> },
    /// No resource at that path. The request was dropped.
    NotFound,
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Merge actor has stopped")]
    Stopped,

    #[error("Failed to save merged resource: {0}")]
    Save(#[source] CodebaseError),

    #[error("Failed to spawn merge actor thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to build merge actor runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("Merge actor thread panicked")]
    Panicked,

    #[error("Failed to join merge actor thread: {0}")]
    Join(String),
}

enum Message {
    Merge {
        path: String,
        attrs: AttributeMapping,
        reply: oneshot::Sender<Result<MergeOutcome, CodebaseError>>,
    },
    Stop,
}

/// Owner side of the actor. Closing it hands the codebase back.
pub struct MergeActor {
    tx: mpsc::UnboundedSender<Message>,
    thread: Option<thread::JoinHandle<Codebase>>,
}

/// Cloneable submit side.
#[derive(Clone)]
pub struct MergeHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl MergeActor {
    /// Move `codebase` onto the actor thread and wait until its loop runs.
    pub async fn open(codebase: Codebase) -> Result<Self, MergeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name("merge-actor".to_string())
            .spawn(move || run_actor(codebase, rx, ready_tx))
            .map_err(MergeError::Spawn)?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(MergeError::Runtime(e)),
            Err(_) => return Err(MergeError::Panicked),
        }
        debug!("Merge actor started");

        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> MergeHandle {
        MergeHandle {
            tx: self.tx.clone(),
        }
    }

    /// Merge through the owner without cloning a handle. See
    /// [`MergeHandle::submit`].
    pub fn submit(
        &self,
        path: impl Into<String>,
        attrs: AttributeMapping,
    ) -> impl Future<Output = Result<MergeOutcome, MergeError>> + Send + 'static {
        send_merge(&self.tx, path.into(), attrs)
    }

    /// Stop after every previously submitted merge and take the codebase
    /// back.
    pub async fn close(mut self) -> Result<Codebase, MergeError> {
        let _ = self.tx.send(Message::Stop);
        let thread = self.thread.take().ok_or(MergeError::Stopped)?;
        let joined = tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| MergeError::Join(e.to_string()))?;
        let codebase = joined.map_err(|_| MergeError::Panicked)?;
        debug!("Merge actor closed");
        Ok(codebase)
    }
}

impl Drop for MergeActor {
    fn drop(&mut self) {
        if self.thread.take().is_some() {
            debug!("Merge actor dropped without close, stopping its thread");
            let _ = self.tx.send(Message::Stop);
        }
    }
}

impl MergeHandle {
    /// Enqueue a merge. The request takes its place in the mailbox when
    /// `submit` is called, not when the returned future is first polled;
    /// the future resolves to the outcome.
    pub fn submit(
        &self,
        path: impl Into<String>,
        attrs: AttributeMapping,
    ) -> impl Future<Output = Result<MergeOutcome, MergeError>> + Send + 'static {
        send_merge(&self.tx, path.into(), attrs)
    }
}

fn send_merge(
    tx: &mpsc::UnboundedSender<Message>,
    path: String,
    attrs: AttributeMapping,
) -> impl Future<Output = Result<MergeOutcome, MergeError>> + Send + 'static {
    let (reply, outcome) = oneshot::channel();
    let sent = tx.send(Message::Merge { path, attrs, reply });
    async move {
        sent.map_err(|_| MergeError::Stopped)?;
        match outcome.await {
            Ok(result) => result.map_err(MergeError::Save),
            Err(_) => Err(MergeError::Stopped),
        }
    }
}

fn run_actor(
    mut codebase: Codebase,
    mut rx: mpsc::UnboundedReceiver<Message>,
    ready_tx: oneshot::Sender<std::io::Result<()>>,
) -> Codebase {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return codebase;
        }
    };

    runtime.block_on(async {
        let _ = ready_tx.send(Ok(()));
        let mut merged = 0u64;
        let mut not_found = 0u64;
        while let Some(message) = rx.recv().await {
            match message {
                Message::Merge { path, attrs, reply } => {
                    let outcome = apply_merge(&mut codebase, &path, attrs);
                    match &outcome {
                        Ok(MergeOutcome::Applied { .. }) => merged += 1,
                        Ok(MergeOutcome::NotFound) => not_found += 1,
                        Err(e) => warn!(path, "Failed to save merged resource: {}", e),
                    }
                    let _ = reply.send(outcome);
                }
                Message::Stop => break,
            }
        }
        debug!(merged, not_found, "Merge actor loop finished");
    });
    codebase
}

fn apply_merge(
    codebase: &mut Codebase,
    path: &str,
    attrs: AttributeMapping,
) -> Result<MergeOutcome, CodebaseError> {
    let Some(resource) = codebase.get(path) else {
        warn!(path, "Merge target not found, dropping merge request");
        return Ok(MergeOutcome::NotFound);
    };
    let mut resource = resource.clone();
    let fields = resource.attributes.merge(attrs);
    if !fields.is_empty() {
        codebase.save(resource)?;
    }
    Ok(MergeOutcome::Applied { fields })
}
