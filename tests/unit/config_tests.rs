use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use serial_test::serial;
use worker_bridge::config::{BridgeConfig, PathStyle, INTERPRETER_ENV};
use worker_bridge::AppError;

fn sample_toml() -> &'static str {
    r#"
[worker]
interpreter = "/opt/venv/bin/python"
interpreter_args = ["-X", "utf8"]
script = "/opt/bridge/worker.py"
args = ["--stdio"]
path_style = "wsl"
bundle_path = "/etc/bridge/bundle.yaml"
log_level = "DEBUG"
log_file = "/tmp/bridge.log"
working_dir = "/opt/bridge"

[timeouts]
initialize_seconds = 120
execute_seconds = 90
shutdown_grace_millis = 250
probe_seconds = 3

[sanitizer]
extra_patterns = ["^DEBUG:", "(?i)^telemetry"]
"#
}

#[test]
fn parses_full_config() {
    let config = BridgeConfig::from_toml_str(sample_toml()).expect("valid config");

    assert_eq!(config.worker.interpreter, "/opt/venv/bin/python");
    assert_eq!(config.worker.interpreter_args, vec!["-X", "utf8"]);
    assert_eq!(
        config.worker.script,
        Some(PathBuf::from("/opt/bridge/worker.py"))
    );
    assert_eq!(config.worker.args, vec!["--stdio"]);
    assert_eq!(config.worker.path_style, PathStyle::Wsl);
    assert_eq!(
        config.worker.bundle_path,
        PathBuf::from("/etc/bridge/bundle.yaml")
    );
    assert_eq!(config.worker.log_level, "DEBUG");
    assert_eq!(config.worker.log_file, Some(PathBuf::from("/tmp/bridge.log")));
    assert_eq!(config.worker.working_dir, Some(PathBuf::from("/opt/bridge")));

    assert_eq!(config.timeouts.initialize(), Duration::from_secs(120));
    assert_eq!(config.timeouts.execute(), Duration::from_secs(90));
    assert_eq!(config.timeouts.shutdown_grace(), Duration::from_millis(250));
    assert_eq!(config.timeouts.probe(), Duration::from_secs(3));
    assert_eq!(config.sanitizer.extra_patterns.len(), 2);
}

#[test]
fn empty_document_uses_defaults() {
    let config = BridgeConfig::from_toml_str("").expect("defaults are valid");
    assert_eq!(config, BridgeConfig::default());

    assert_eq!(config.worker.path_style, PathStyle::Native);
    assert_eq!(config.worker.log_level, "WARNING");
    assert!(config.worker.script.is_none());
    assert_eq!(config.timeouts.initialize_seconds, 300);
    assert_eq!(config.timeouts.execute_seconds, 600);
    assert_eq!(config.timeouts.shutdown_grace_millis, 500);
    assert_eq!(config.timeouts.probe_seconds, 10);
    assert!(config.sanitizer.extra_patterns.is_empty());
}

#[cfg(not(windows))]
#[test]
fn default_interpreter_is_python3() {
    assert_eq!(BridgeConfig::default().worker.interpreter, "python3");
}

#[test]
fn partial_sections_keep_other_defaults() {
    let config = BridgeConfig::from_toml_str(
        r#"
[timeouts]
execute_seconds = 5
"#,
    )
    .expect("valid config");

    assert_eq!(config.timeouts.execute_seconds, 5);
    assert_eq!(config.timeouts.initialize_seconds, 300);
    assert_eq!(config.worker, BridgeConfig::default().worker);
}

// ── Validation ───────────────────────────────────────────────────────────────

#[test]
fn empty_interpreter_is_rejected() {
    let err = BridgeConfig::from_toml_str("[worker]\ninterpreter = \"  \"\n")
        .expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
    assert!(err.to_string().contains("interpreter"));
}

#[test]
fn zero_timeouts_are_rejected() {
    for toml in [
        "[timeouts]\nexecute_seconds = 0\n",
        "[timeouts]\ninitialize_seconds = 0\n",
    ] {
        let err = BridgeConfig::from_toml_str(toml).expect_err("must fail");
        assert!(matches!(err, AppError::Config(_)), "{toml}: {err:?}");
    }
}

#[test]
fn invalid_extra_pattern_is_rejected() {
    let err = BridgeConfig::from_toml_str("[sanitizer]\nextra_patterns = [\"[oops\"]\n")
        .expect_err("must fail");
    assert!(err.to_string().contains("invalid sanitizer pattern"));
}

#[test]
fn unknown_path_style_is_rejected() {
    let err = BridgeConfig::from_toml_str("[worker]\npath_style = \"cygwin\"\n")
        .expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn malformed_toml_is_config_error() {
    let err = BridgeConfig::from_toml_str("[worker\ninterpreter = 1").expect_err("must fail");
    assert!(err.to_string().starts_with("config: invalid config"));
}

// ── Loading from disk ────────────────────────────────────────────────────────

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(sample_toml().as_bytes()).expect("write");

    let config = BridgeConfig::load_from_path(file.path()).expect("load");
    assert_eq!(config.timeouts.execute_seconds, 90);
}

#[test]
fn missing_file_is_config_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = BridgeConfig::load_from_path(dir.path().join("absent.toml"))
        .expect_err("must fail");
    assert!(err.to_string().contains("failed to read config"));
}

// ── Environment overrides ────────────────────────────────────────────────────

#[test]
#[serial]
fn env_override_replaces_interpreter() {
    std::env::set_var(INTERPRETER_ENV, "/usr/local/bin/python3.12");
    let mut config = BridgeConfig::default();
    config.apply_env_overrides();
    std::env::remove_var(INTERPRETER_ENV);

    assert_eq!(config.worker.interpreter, "/usr/local/bin/python3.12");
}

#[test]
#[serial]
fn blank_env_override_is_ignored() {
    std::env::set_var(INTERPRETER_ENV, "   ");
    let mut config = BridgeConfig::from_toml_str("[worker]\ninterpreter = \"py\"\n").expect("valid");
    config.apply_env_overrides();
    std::env::remove_var(INTERPRETER_ENV);

    assert_eq!(config.worker.interpreter, "py");
}

#[test]
#[serial]
fn absent_env_override_keeps_file_value() {
    std::env::remove_var(INTERPRETER_ENV);
    let mut config = BridgeConfig::from_toml_str("[worker]\ninterpreter = \"py\"\n").expect("valid");
    config.apply_env_overrides();

    assert_eq!(config.worker.interpreter, "py");
}
