//! Output writer: serializes finished codebases on a small pool of I/O
//! threads, separate from the analyzer workers.

use crate::codebase::Codebase;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize codebase: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Output destination has no file name: {}", .0.display())]
    InvalidDestination(PathBuf),

    #[error("Output writer is shut down")]
    ShutDown,

    #[error("Failed to spawn output thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Output thread dropped the write")]
    Lost,

    #[error("Output write abandoned, caller is gone")]
    Abandoned,
}

impl OutputError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A completed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub path: PathBuf,
    pub bytes: u64,
    pub elapsed: Duration,
}

struct WriteJob {
    codebase: Codebase,
    destination: PathBuf,
    reply: oneshot::Sender<Result<WriteReport, OutputError>>,
}

/// Handle to the I/O pool. Clones share the same threads.
#[derive(Clone)]
pub struct OutputWriter {
    inner: Arc<Inner>,
}

struct Inner {
    sender: Mutex<Option<Sender<WriteJob>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OutputWriter {
    /// Start `threads` I/O threads (at least one).
    pub fn start(threads: usize) -> Result<Self, OutputError> {
        let (sender, receiver) = mpsc::channel::<WriteJob>();
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..threads.max(1))
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("output-writer-{index}"))
                    .spawn(move || run_io_thread(receiver))
                    .map_err(OutputError::Spawn)
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(threads = handles.len(), "Output writer started");

        Ok(Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(sender)),
                threads: Mutex::new(handles),
            }),
        })
    }

    /// Queue `codebase` for an atomic write to `destination`.
    pub async fn write(
        &self,
        codebase: Codebase,
        destination: impl Into<PathBuf>,
    ) -> Result<WriteReport, OutputError> {
        let (reply, report) = oneshot::channel();
        {
            let sender = lock(&self.inner.sender);
            let sender = sender.as_ref().ok_or(OutputError::ShutDown)?;
            sender
                .send(WriteJob {
                    codebase,
                    destination: destination.into(),
                    reply,
                })
                .map_err(|_| OutputError::ShutDown)?;
        }
        report.await.map_err(|_| OutputError::Lost)?
    }

    /// Refuse new writes, let queued writes finish and join the threads.
    pub async fn shutdown(&self) {
        drop(lock(&self.inner.sender).take());
        let threads = std::mem::take(&mut *lock(&self.inner.threads));
        if threads.is_empty() {
            return;
        }
        let joined = tokio::task::spawn_blocking(move || {
            for handle in threads {
                if handle.join().is_err() {
                    warn!("Output writer thread panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            warn!("Failed to join output writer threads: {}", e);
        }
        debug!("Output writer stopped");
    }
}

fn run_io_thread(receiver: Arc<Mutex<Receiver<WriteJob>>>) {
    loop {
        let job = match lock(&receiver).recv() {
            Ok(job) => job,
            Err(_) => break,
        };
        if job.reply.is_closed() {
            debug!(path = %job.destination.display(), "Skipping write for a cancelled caller");
            continue;
        }
        let started = Instant::now();
        let result = write_atomic_if(&job.codebase, &job.destination, || {
            !job.reply.is_closed()
        })
        .map(|bytes| WriteReport {
            path: job.destination.clone(),
            bytes,
            elapsed: started.elapsed(),
        });
        match &result {
            Ok(report) => info!(
                path = %report.path.display(),
                bytes = report.bytes,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Wrote scan output"
            ),
            Err(OutputError::Abandoned) => {
                debug!(path = %job.destination.display(), "Dropped write for a cancelled caller")
            }
            Err(e) => warn!("Failed to write scan output: {}", e),
        }
        let _ = job.reply.send(result);
    }
}

/// `<destination>.<uuid>.tmp`, next to the destination.
fn temp_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(format!(".{}.tmp", Uuid::new_v4()));
    PathBuf::from(name)
}

/// Serialize into a temp file, sync it and rename it over `destination`.
/// The temp file never outlives a failure.
pub fn write_atomic(codebase: &Codebase, destination: &Path) -> Result<u64, OutputError> {
    write_atomic_if(codebase, destination, || true)
}

/// Like [`write_atomic`], but `commit` is asked right before the rename.
/// When it returns `false` the temp file is removed, `destination` is left
/// untouched and the write fails with [`OutputError::Abandoned`].
pub fn write_atomic_if(
    codebase: &Codebase,
    destination: &Path,
    commit: impl FnOnce() -> bool,
) -> Result<u64, OutputError> {
    if destination.file_name().is_none() {
        return Err(OutputError::InvalidDestination(destination.to_path_buf()));
    }
    let temp = temp_path(destination);

    let result = write_temp(codebase, &temp).and_then(|bytes| {
        if !commit() {
            return Err(OutputError::Abandoned);
        }
        std::fs::rename(&temp, destination).map_err(|e| OutputError::io(destination, e))?;
        Ok(bytes)
    });
    if result.is_err() {
        if let Err(e) = std::fs::remove_file(&temp) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temp file {}: {}", temp.display(), e);
            }
        }
        return result;
    }
    if let Err(e) = sync_parent_dir(destination) {
        warn!("Failed to sync directory of {}: {}", destination.display(), e);
    }
    result
}

/// Persist the rename by syncing the directory entry.
fn sync_parent_dir(destination: &Path) -> std::io::Result<()> {
    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    #[cfg(unix)]
    File::open(parent)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = parent;
    Ok(())
}

fn write_temp(codebase: &Codebase, temp: &Path) -> Result<u64, OutputError> {
    let file = File::create(temp).map_err(|e| OutputError::io(temp, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &codebase.document())?;
    writer.flush().map_err(|e| OutputError::io(temp, e))?;
    let file = writer
        .into_inner()
        .map_err(|e| OutputError::io(temp, e.into_error()))?;
    file.sync_all().map_err(|e| OutputError::io(temp, e))?;
    let bytes = file.metadata().map_err(|e| OutputError::io(temp, e))?.len();
    Ok(bytes)
}
