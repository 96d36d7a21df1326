//! Scan service launcher
//!
//! - `serve`: HTTP service running scans in the background
//! - `scan`: one scan in the foreground, same pipeline
//! - `worker`: analyzer worker process, driven over stdin/stdout

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scanservice_logging::{init_logging, LogConfig, LogTarget};
use scanservice_sentinel::{router, ScanService, ScanTask, TaskRegistry};
use scanservice_worker::AnalyzerRegistry;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

mod config;

use config::{build_dispatcher, Environment, PipelineArgs, ServeArgs};

#[derive(Parser, Debug)]
#[command(name = "scanservice", version, about = "Parallel file scanning service")]
struct Cli {
    /// Enable debug logging on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP scan service
    Serve(ServeArgs),

    /// Scan a file or directory and write the result
    Scan {
        /// File or directory to scan
        path: PathBuf,

        /// Output JSON file
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Analyzer worker process (internal)
    #[command(hide = true)]
    Worker,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let target = match cli.command {
        Commands::Worker => LogTarget::Stderr,
        _ => LogTarget::FileAndStderr,
    };
    let _log_guard = match init_logging(LogConfig {
        app_name: "scanservice",
        verbose: cli.verbose,
        target,
    }) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Warning: failed to initialize file logging: {:#}", err);
            init_logging(LogConfig {
                app_name: "scanservice",
                verbose: cli.verbose,
                target: LogTarget::Stderr,
            })
            .ok()
            .flatten()
        }
    };

    let result = match cli.command {
        Commands::Serve(args) => run_serve(args),
        Commands::Scan {
            path,
            output,
            pipeline,
        } => run_scan(path, output, pipeline),
        Commands::Worker => run_worker(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:?}", err);
            ExitCode::FAILURE
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("scanservice")
        .build()
        .context("Failed to build tokio runtime")
}

fn run_serve(args: ServeArgs) -> Result<()> {
    let env = Environment::check(args.pipeline.in_process)
        .context("Scan service environment is misconfigured")?;

    runtime()?.block_on(async move {
        let dispatcher = build_dispatcher(&args.pipeline, &env)?;
        let registry = TaskRegistry::new(Duration::from_secs(args.grace));
        let service = ScanService::new(dispatcher, registry);

        let listener = tokio::net::TcpListener::bind(&args.bind)
            .await
            .with_context(|| format!("Failed to bind {}", args.bind))?;
        info!(addr = %listener.local_addr()?, "Scan service listening");

        let served = axum::serve(listener, router(service.clone()))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server failed");
        service.shutdown().await;
        served
    })
}

fn run_scan(path: PathBuf, output: PathBuf, pipeline: PipelineArgs) -> Result<()> {
    let env = Environment::detect(pipeline.in_process)?;
    let task = ScanTask::new(&path, output)?;

    runtime()?.block_on(async move {
        let dispatcher = build_dispatcher(&pipeline, &env)?;
        let result = dispatcher.run(&task).await;
        dispatcher.pool().shutdown().await;
        dispatcher.writer().shutdown().await;

        let summary = result.with_context(|| format!("Scan of {} failed", path.display()))?;
        println!(
            "{}",
            serde_json::json!({
                "uuid": summary.task_id,
                "files": summary.files,
                "output_file": summary.report.path,
                "bytes": summary.report.bytes,
                "duration": summary.elapsed.as_secs_f64(),
            })
        );
        Ok::<(), anyhow::Error>(())
    })
}

fn run_worker() -> Result<()> {
    scanservice_worker::runtime::serve_stdio(&AnalyzerRegistry::builtin())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received, stopping");
}
