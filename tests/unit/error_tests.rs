//! Unit tests for `AppError` display format and classification.

use worker_bridge::AppError;

fn all_variants() -> Vec<AppError> {
    vec![
        AppError::Config("bad".into()),
        AppError::Spawn("missing interpreter".into()),
        AppError::Unavailable("no worker".into()),
        AppError::NotInitialized,
        AppError::Timeout("execute".into()),
        AppError::Worker("model unavailable".into()),
        AppError::Cancelled("user abort".into()),
        AppError::ProcessExited("code 1".into()),
        AppError::Protocol("slot busy".into()),
        AppError::Io("broken pipe".into()),
    ]
}

#[test]
fn display_uses_category_prefix() {
    let expected = [
        "config: ",
        "spawn: ",
        "bridge not available: ",
        "not initialized",
        "timeout: ",
        "worker: ",
        "cancelled: ",
        "process exited: ",
        "protocol: ",
        "io: ",
    ];
    for (err, prefix) in all_variants().iter().zip(expected) {
        assert!(
            err.to_string().starts_with(prefix),
            "`{err}` should start with `{prefix}`"
        );
    }
}

#[test]
fn messages_have_no_trailing_period() {
    for err in all_variants() {
        let s = err.to_string();
        assert!(!s.ends_with('.'), "error message must not end with a period: {s}");
    }
}

#[test]
fn worker_text_is_carried_verbatim() {
    let err = AppError::Worker("model unavailable".into());
    assert_eq!(err.to_string(), "worker: model unavailable");
    assert_eq!(err.worker_message(), Some("model unavailable"));
    assert!(err.is_worker_error());
}

#[test]
fn classification_predicates_are_exclusive() {
    for err in all_variants() {
        let hits = [err.is_timeout(), err.is_cancellation(), err.is_worker_error()]
            .iter()
            .filter(|&&b| b)
            .count();
        assert!(hits <= 1, "{err:?} matched more than one class");
    }
    assert!(AppError::Timeout("t".into()).is_timeout());
    assert!(AppError::Cancelled("c".into()).is_cancellation());
    assert!(!AppError::ProcessExited("p".into()).is_worker_error());
    assert_eq!(AppError::Spawn("s".into()).worker_message(), None);
}

#[test]
fn io_error_converts_to_io_variant() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let err = AppError::from(io);
    assert!(matches!(err, AppError::Io(ref msg) if msg == "pipe closed"), "got {err:?}");
}

#[test]
fn implements_std_error() {
    fn assert_error<E: std::error::Error + Send + Sync + 'static>(_: &E) {}
    assert_error(&AppError::NotInitialized);
}
