//! Command line configuration and the startup environment check.

use anyhow::{bail, Context, Result};
use clap::Args;
use scanservice_protocol::defaults::{
    DEFAULT_BIND_ADDR, DEFAULT_DELTA_T_SECS, DEFAULT_GRACE_SECS, DEFAULT_IO_THREADS,
    DEFAULT_PROCESSES, TEMP_DIR_ENV,
};
use scanservice_sentinel::{Dispatcher, DispatcherConfig, IgnoreRules, OutputWriter};
use scanservice_worker::{AnalyzerRegistry, PoolConfig, ProcessConfig, WorkerPool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Pipeline settings shared by `serve` and `scan`.
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Number of analyzer workers
    #[arg(long, env = "SCANSERVICE_PROCESSES", default_value_t = DEFAULT_PROCESSES)]
    pub processes: usize,

    /// Per-file deadline in seconds
    #[arg(long = "delta-t", env = "SCANSERVICE_DELTA_T", default_value_t = DEFAULT_DELTA_T_SECS)]
    pub delta_t: u64,

    /// Threads dedicated to writing output files
    #[arg(long, env = "SCANSERVICE_IO_THREADS", default_value_t = DEFAULT_IO_THREADS)]
    pub io_threads: usize,

    /// Run analyzers on this process's blocking pool instead of worker processes
    #[arg(long, env = "SCANSERVICE_IN_PROCESS")]
    pub in_process: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "SCANSERVICE_BIND", default_value = DEFAULT_BIND_ADDR)]
    pub bind: String,

    /// Seconds a finished scan stays queryable
    #[arg(long, env = "SCANSERVICE_GRACE_SECS", default_value_t = DEFAULT_GRACE_SECS)]
    pub grace: u64,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

/// Resolved process environment for the worker pool.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Temp directory handed to worker processes.
    pub temp_dir: Option<PathBuf>,
    /// Executable re-run as `worker`. `None` for the in-process backend.
    pub worker_exe: Option<PathBuf>,
}

impl Environment {
    /// Strict check used by `serve`: the temp directory must be configured
    /// and the worker executable must exist.
    pub fn check(in_process: bool) -> Result<Self> {
        let temp_dir = std::env::var_os(TEMP_DIR_ENV)
            .map(PathBuf::from)
            .with_context(|| format!("{} is not set", TEMP_DIR_ENV))?;
        if !temp_dir.is_dir() {
            bail!(
                "{} is not a directory: {}",
                TEMP_DIR_ENV,
                temp_dir.display()
            );
        }
        let worker_exe = if in_process {
            None
        } else {
            Some(worker_exe()?)
        };
        Ok(Self {
            temp_dir: Some(temp_dir),
            worker_exe,
        })
    }

    /// Lenient check used by one-shot scans: the temp directory is optional.
    pub fn detect(in_process: bool) -> Result<Self> {
        let temp_dir = std::env::var_os(TEMP_DIR_ENV)
            .map(PathBuf::from)
            .filter(|dir| dir.is_dir());
        let worker_exe = if in_process {
            None
        } else {
            Some(worker_exe()?)
        };
        Ok(Self {
            temp_dir,
            worker_exe,
        })
    }
}

fn worker_exe() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate the worker executable")?;
    if !exe.is_file() {
        bail!("Worker executable not found: {}", exe.display());
    }
    Ok(exe)
}

/// Start the pool and the writer and assemble a dispatcher. Must be called
/// inside a tokio runtime.
pub fn build_dispatcher(args: &PipelineArgs, env: &Environment) -> Result<Dispatcher> {
    let pool_config = match &env.worker_exe {
        Some(exe) => {
            let mut process = ProcessConfig::new(exe);
            if let Some(temp_dir) = &env.temp_dir {
                process = process.with_temp_dir(temp_dir);
            }
            PoolConfig::process(args.processes, process)
        }
        None => PoolConfig::in_process(args.processes, AnalyzerRegistry::builtin()),
    };
    let pool = WorkerPool::start(pool_config);
    let writer = OutputWriter::start(args.io_threads).context("Failed to start output writer")?;
    let config = DispatcherConfig::for_pool(args.processes)
        .with_delta_t(Duration::from_secs(args.delta_t));

    info!(
        processes = args.processes,
        delta_t = args.delta_t,
        io_threads = args.io_threads,
        in_process = env.worker_exe.is_none(),
        "Pipeline configured"
    );
    Ok(Dispatcher::new(
        pool,
        writer,
        Arc::new(IgnoreRules::default()),
        config,
    ))
}
