//! Parent side of an isolated worker process.
//!
//! Each pool slot owns at most one child. The child reads `Call` frames on
//! stdin and answers with `Result`/`Failed` frames on stdout, one at a time.

use scanservice_protocol::defaults::TEMP_DIR_ENV;
use scanservice_protocol::{
    AnalyzerCall, Frame, Header, OpCode, ProtocolError, HEADER_SIZE,
};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How to launch a worker process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment for the child.
    pub envs: Vec<(String, String)>,
    /// Temp directory handed to the child as `TMPDIR`.
    pub temp_dir: Option<PathBuf>,
    /// How long teardown waits for a clean exit before killing.
    pub exit_timeout: Duration,
}

impl ProcessConfig {
    /// `<program> worker`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["worker".to_string()],
            envs: Vec::new(),
            temp_dir: None,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        }
    }

    /// Re-run the current executable as a worker.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(temp_dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn worker {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker pipe error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Worker closed its output")]
    Closed,

    #[error("Reply for call {got} while waiting for {expected}")]
    CallIdMismatch { expected: u64, got: u64 },
}

/// A running worker child.
pub struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    next_call_id: u64,
    exit_timeout: Duration,
}

impl WorkerProcess {
    pub fn spawn(config: &ProcessConfig) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .envs(config.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(temp_dir) = &config.temp_dir {
            cmd.env(TEMP_DIR_ENV, temp_dir)
                .env("TMPDIR", temp_dir)
                .env("TEMP", temp_dir)
                .env("TMP", temp_dir);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: config.program.clone(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(ProcessError::Closed)?;
        let stdout = child.stdout.take().ok_or(ProcessError::Closed)?;
        debug!(pid = ?child.id(), "Spawned worker process");

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            next_call_id: 1,
            exit_timeout: config.exit_timeout,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Send one call and wait for its reply frame.
    pub async fn roundtrip(&mut self, call: &AnalyzerCall) -> Result<Frame, ProcessError> {
        let call_id = self.next_call_id;
        self.next_call_id += 1;

        let bytes = Frame::call(call_id, call)?.to_bytes()?;
        let stdin = self.stdin.as_mut().ok_or(ProcessError::Closed)?;
        stdin.write_all(&bytes).await?;
        stdin.flush().await?;

        let reply = self.read_frame().await?;
        if reply.call_id() != call_id {
            return Err(ProcessError::CallIdMismatch {
                expected: call_id,
                got: reply.call_id(),
            });
        }
        if reply.opcode() == OpCode::Call {
            return Err(ProtocolError::UnexpectedOpCode {
                expected: "Result or Failed",
                got: reply.opcode(),
            }
            .into());
        }
        Ok(reply)
    }

    async fn read_frame(&mut self) -> Result<Frame, ProcessError> {
        let mut header_buf = [0u8; HEADER_SIZE];
        match self.stdout.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProcessError::Closed)
            }
            Err(e) => return Err(e.into()),
        }
        let header = Header::unpack(&header_buf)?;
        let mut payload = vec![0u8; header.payload_len as usize];
        self.stdout.read_exact(&mut payload).await?;
        Ok(Frame { header, payload })
    }

    /// Close stdin so the child's loop ends, then wait for it to exit.
    /// Kills the child if it does not exit in time.
    pub async fn shutdown(mut self) {
        drop(self.stdin.take());
        match tokio::time::timeout(self.exit_timeout, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Worker process exited"),
            Ok(Err(e)) => warn!("Failed to wait for worker process: {}", e),
            Err(_) => {
                warn!(
                    "Worker process did not exit within {:?}, killing",
                    self.exit_timeout
                );
                self.kill().await;
            }
        }
    }

    /// Kill without waiting for a clean exit.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Failed to kill worker process: {}", e);
        }
    }
}
