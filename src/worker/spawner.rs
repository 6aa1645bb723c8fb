//! Worker process spawner.
//!
//! Spawns the worker interpreter with:
//! - `kill_on_drop(true)` so an abandoned process never outlives the bridge.
//! - `env_clear()` + a safe variable allowlist, plus the worker's own logging
//!   variables.
//! - All three stdio streams piped: stdin/stdout carry the protocol, stderr
//!   is drained for diagnostics only.

use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use crate::config::{BridgeConfig, WorkerConfig};
use crate::worker::path::translate_path;
use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by the worker process.
///
/// Every other variable from the host environment is stripped via
/// `env_clear()` before the child is launched.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "LC_ALL",
    "RUST_LOG",
    // Python interpreter discovery.
    "PYTHONPATH",
    "PYTHONHOME",
    "VIRTUAL_ENV",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
    "WSLENV",
];

/// Worker log level variable.
pub const LOG_LEVEL_ENV: &str = "AMPLIFIER_LOG_LEVEL";

/// Worker log file variable.
pub const LOG_FILE_ENV: &str = "AMPLIFIER_BRIDGE_LOG";

// ── Connection handle ────────────────────────────────────────────────────────

/// Stdio handles of a freshly spawned worker.
#[derive(Debug)]
pub struct WorkerConnection {
    /// OS process id, if the platform reported one.
    pub pid: Option<u32>,
    /// Child process handle; dropping it kills the worker.
    pub child: Child,
    /// Worker stdin, for commands.
    pub stdin: ChildStdin,
    /// Worker stdout, for protocol messages.
    pub stdout: ChildStdout,
    /// Worker stderr, for diagnostics.
    pub stderr: ChildStderr,
}

/// Program and argument vector the worker is launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Interpreter binary.
    pub program: String,
    /// Arguments in order: interpreter args, script, script args.
    pub args: Vec<String>,
}

/// Resolve the launch plan for `config`, translating the script path.
#[must_use]
pub fn launch_plan(config: &WorkerConfig) -> LaunchPlan {
    let mut args = config.interpreter_args.clone();
    if let Some(script) = &config.script {
        args.push(translate_path(script, config.path_style));
    }
    args.extend(config.args.iter().cloned());

    LaunchPlan {
        program: config.interpreter.clone(),
        args,
    }
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// Spawn the worker process and capture its stdio.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// - `AppError::Spawn("failed to spawn worker …")`: OS spawn failure
///   (missing interpreter, permission denied, bad working directory).
/// - `AppError::Spawn("failed to capture worker …")`: a pipe was not created.
pub fn spawn_worker(config: &WorkerConfig) -> Result<WorkerConnection> {
    let plan = launch_plan(config);
    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args);

    // Strip inherited environment, then inject only the safe allowlist.
    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }

    // Worker-specific settings. Unbuffered output keeps chunks streaming.
    cmd.env("PYTHONUNBUFFERED", "1");
    cmd.env(LOG_LEVEL_ENV, &config.log_level);
    if let Some(log_file) = &config.log_file {
        cmd.env(LOG_FILE_ENV, translate_path(log_file, config.path_style));
    }

    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(program = %plan.program, args = ?plan.args, "spawning worker");

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!("failed to spawn worker `{}`: {err}", plan.program))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture worker stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture worker stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture worker stderr".into()))?;

    let pid = child.id();
    info!(worker_pid = ?pid, program = %plan.program, "worker spawned");

    Ok(WorkerConnection {
        pid,
        child,
        stdin,
        stdout,
        stderr,
    })
}

// ── Availability probe ───────────────────────────────────────────────────────

/// Result of a successful interpreter probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// Interpreter that answered.
    pub interpreter: String,
    /// First line the interpreter printed for `--version`.
    pub version: String,
}

/// Cheaply check that the worker interpreter can be launched.
///
/// Runs `<interpreter> [interpreter_args] --version` under the probe
/// deadline. The persistent worker is never started.
///
/// # Errors
///
/// - `AppError::Spawn`: the interpreter could not be run or exited non-zero.
/// - `AppError::Timeout`: no answer within `timeouts.probe_seconds`.
pub async fn probe(config: &BridgeConfig) -> Result<ProbeReport> {
    let worker = &config.worker;
    let mut cmd = Command::new(&worker.interpreter);
    cmd.args(&worker.interpreter_args)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let deadline = config.timeouts.probe();
    let output = tokio::time::timeout(deadline, cmd.output())
        .await
        .map_err(|_| {
            AppError::Timeout(format!(
                "interpreter `{}` did not answer within {deadline:?}",
                worker.interpreter
            ))
        })?
        .map_err(|err| {
            AppError::Spawn(format!(
                "failed to run interpreter `{}`: {err}",
                worker.interpreter
            ))
        })?;

    if !output.status.success() {
        return Err(AppError::Spawn(format!(
            "interpreter `{}` exited with {}",
            worker.interpreter, output.status
        )));
    }

    // Older interpreters print the version on stderr.
    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr)
    } else {
        String::from_utf8_lossy(&output.stdout)
    };
    let version = text.lines().next().unwrap_or_default().trim().to_owned();

    Ok(ProbeReport {
        interpreter: worker.interpreter.clone(),
        version,
    })
}
