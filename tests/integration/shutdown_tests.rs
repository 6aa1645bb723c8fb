//! Shutdown behaviour: idempotence, pending-call rejection, forced
//! termination, and restart after a shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::test_helpers::{fake_bridge, run_turn, script_config};
use worker_bridge::worker::supervisor::WorkerState;
use worker_bridge::{AppError, WorkerBridge};

/// Shutting down a bridge that never started a worker is a no-op.
#[tokio::test]
async fn shutdown_without_worker_is_noop() {
    let bridge = fake_bridge();
    bridge.shutdown().await;
    assert_eq!(bridge.state().await, WorkerState::Absent);
}

/// Repeated shutdowns are safe and leave the bridge absent and uninitialized.
#[tokio::test]
async fn shutdown_is_idempotent() {
    let bridge = fake_bridge();
    bridge.initialize(Path::new("/ws")).await.expect("initialize");

    bridge.shutdown().await;
    bridge.shutdown().await;

    assert_eq!(bridge.state().await, WorkerState::Absent);
    assert!(!bridge.is_initialized().await);
    let (result, _) = run_turn(&bridge, "hi").await;
    assert!(matches!(result, Err(AppError::NotInitialized)));
}

/// A cooperative worker exits on the `shutdown` command within the grace period.
#[tokio::test]
async fn cooperative_worker_exits_within_grace() {
    let bridge = fake_bridge();
    bridge.initialize(Path::new("/ws")).await.expect("initialize");

    let started = Instant::now();
    bridge.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1));
}

/// A worker ignoring both `shutdown` and `SIGTERM` is killed.
#[tokio::test]
async fn stubborn_worker_is_killed() {
    let script = r#"
trap '' TERM
IFS= read -r line
printf '%s\n' '{"status":"initialized"}'
while :; do sleep 1; done
"#;
    let mut config = script_config(script);
    config.timeouts.shutdown_grace_millis = 200;
    let bridge = WorkerBridge::new(config).expect("bridge");
    bridge.initialize(Path::new("/ws")).await.expect("initialize");

    let started = Instant::now();
    bridge.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(bridge.state().await, WorkerState::Absent);
}

/// A call pending during shutdown fails with a process-exited error.
#[tokio::test]
async fn shutdown_rejects_pending_call() {
    let bridge = Arc::new(fake_bridge());
    bridge.initialize(Path::new("/ws")).await.expect("initialize");

    let turn = tokio::spawn({
        let bridge = Arc::clone(&bridge);
        async move { run_turn(&bridge, "slow").await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    bridge.shutdown().await;

    let (result, chunks) = turn.await.expect("turn task");
    let err = result.expect_err("pending turn must fail");
    assert!(matches!(err, AppError::ProcessExited(_)), "got {err:?}");
    assert!(chunks.is_empty());
}

/// After shutdown, initialize starts a fresh worker.
#[tokio::test]
async fn initialize_after_shutdown_restarts_worker() {
    let bridge = fake_bridge();
    bridge.initialize(Path::new("/ws")).await.expect("initialize");
    bridge.shutdown().await;

    bridge.initialize(Path::new("/ws")).await.expect("re-initialize");
    let (result, chunks) = run_turn(&bridge, "hi").await;
    result.expect("execute");
    assert_eq!(chunks, vec!["Hello"]);

    bridge.shutdown().await;
}
