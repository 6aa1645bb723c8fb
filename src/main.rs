#![forbid(unsafe_code)]

//! `worker-bridge`: command-line host for the persistent worker bridge.
//!
//! Loads the bridge configuration, starts the worker on demand and either
//! probes the interpreter, runs a single prompt, or holds an interactive
//! chat session where every input line is one turn. Answers go to stdout;
//! logs go to stderr.

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use worker_bridge::{AppError, BridgeConfig, Result, WorkerBridge};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "worker-bridge", about = "Persistent worker subprocess bridge", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Built-in defaults when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Check that the worker interpreter can be launched.
    Probe,
    /// Initialize against a workspace and run a single prompt.
    Run {
        /// Workspace root sent with `initialize`.
        #[arg(long)]
        workspace: PathBuf,
        /// Prompt text for the turn.
        #[arg(long)]
        prompt: String,
    },
    /// Interactive session: one turn per stdin line. Ctrl-C cancels the turn.
    Chat {
        /// Workspace root sent with `initialize`.
        #[arg(long)]
        workspace: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load_from_path(path)?,
        None => BridgeConfig::default(),
    };
    config.apply_env_overrides();
    let bridge = WorkerBridge::new(config)?;
    info!(interpreter = %bridge.config().worker.interpreter, "configuration loaded");

    let outcome = match args.command {
        Mode::Probe => probe(&bridge).await,
        Mode::Run { workspace, prompt } => run_once(&bridge, &workspace, &prompt).await,
        Mode::Chat { workspace } => chat(&bridge, &workspace).await,
    };

    // ── Shutdown ────────────────────────────────────────
    bridge.shutdown().await;
    info!("worker-bridge shut down");
    outcome
}

async fn probe(bridge: &WorkerBridge) -> Result<()> {
    let report = bridge.probe().await?;
    println!("{}: {}", report.interpreter, report.version);
    Ok(())
}

async fn run_once(bridge: &WorkerBridge, workspace: &Path, prompt: &str) -> Result<()> {
    let workspace = canonical_workspace(workspace)?;
    bridge.initialize(&workspace).await?;
    turn(bridge, prompt).await
}

async fn chat(bridge: &WorkerBridge, workspace: &Path) -> Result<()> {
    let workspace = canonical_workspace(workspace)?;
    bridge.initialize(&workspace).await?;
    eprintln!("ready; one prompt per line, Ctrl-D to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }

        // A crashed worker needs a fresh session before the next turn.
        if !bridge.is_initialized().await {
            info!("worker not initialized, re-initializing");
            if let Err(err) = bridge.initialize(&workspace).await {
                warn!(%err, "re-initialize failed");
                eprintln!("error: {err}");
                continue;
            }
        }

        match turn(bridge, prompt).await {
            Ok(()) => {}
            Err(err) if err.is_cancellation() => eprintln!("(cancelled)"),
            Err(err) => eprintln!("error: {err}"),
        }
    }

    Ok(())
}

/// Run one turn, printing chunks as they arrive; Ctrl-C cancels it.
///
/// Chunks are written back to back, since a worker may stream partial words,
/// and the answer is closed with a single newline.
async fn turn(bridge: &WorkerBridge, prompt: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let mut printed = false;
    let result = bridge
        .execute(
            prompt,
            |chunk| {
                printed = true;
                let mut out = std::io::stdout().lock();
                if let Err(err) = write!(out, "{chunk}").and_then(|()| out.flush()) {
                    warn!(%err, "failed to write chunk to stdout");
                }
            },
            &cancel,
        )
        .await;

    interrupt.abort();
    if printed {
        if let Err(err) = writeln!(std::io::stdout().lock()) {
            warn!(%err, "failed to write to stdout");
        }
    }
    result
}

fn canonical_workspace(workspace: &Path) -> Result<PathBuf> {
    workspace
        .canonicalize()
        .map_err(|err| AppError::Config(format!("invalid workspace `{}`: {err}", workspace.display())))
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stdout carries answers; diagnostics stay on stderr.
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
