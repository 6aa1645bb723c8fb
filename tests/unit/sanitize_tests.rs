//! Unit tests for the output sanitizer.

use worker_bridge::sanitize::{Sanitizer, DEFAULT_BANNER_PATTERNS};
use worker_bridge::AppError;

fn sanitizer() -> Sanitizer {
    Sanitizer::new(&[]).expect("built-in patterns compile")
}

// ── Pass-through ─────────────────────────────────────────────────────────────

/// Ordinary answer text comes through untouched.
#[test]
fn plain_text_is_unchanged() {
    let text = "Hello **world**\n\nSecond paragraph\n- item one\n\tindented";
    assert_eq!(sanitizer().sanitize(text), text);
}

/// Sanitizing is idempotent.
#[test]
fn sanitize_is_idempotent() {
    let s = sanitizer();
    let once = s.sanitize("\x1b[1mBold\x1b[0m\n\n\n\nnext\n────\n");
    assert_eq!(s.sanitize(&once), once);
}

// ── Control sequences ────────────────────────────────────────────────────────

/// ANSI colour codes are removed, the text they wrap is kept.
#[test]
fn ansi_colour_codes_are_stripped() {
    assert_eq!(sanitizer().sanitize("\x1b[32mok\x1b[0m done"), "ok done");
}

/// OSC sequences such as window-title updates are removed.
#[test]
fn osc_sequences_are_stripped() {
    assert_eq!(sanitizer().sanitize("\x1b]0;worker\x07answer"), "answer");
}

/// Stray C0 control bytes are removed; tabs survive.
#[test]
fn stray_controls_are_removed() {
    assert_eq!(sanitizer().sanitize("a\x08b\x00c\td"), "abc\td");
}

/// Carriage returns become line breaks, so redraw frames split into lines.
#[test]
fn carriage_returns_are_normalised() {
    assert_eq!(sanitizer().sanitize("one\r\ntwo\rthree"), "one\ntwo\nthree");
}

// ── Newline handling ─────────────────────────────────────────────────────────

/// Three or more consecutive newlines collapse to a single blank line.
#[test]
fn newline_runs_collapse_to_two() {
    assert_eq!(sanitizer().sanitize("a\n\n\n\n\nb"), "a\n\nb");
    assert_eq!(sanitizer().sanitize("a\n\nb"), "a\n\nb");
}

/// Whitespace-only lines become empty and blank edges are trimmed.
#[test]
fn blank_edges_are_trimmed() {
    assert_eq!(sanitizer().sanitize("  \n\nHello\n   \n"), "Hello");
}

/// Lines removed as noise do not leave long gaps behind.
#[test]
fn removed_lines_do_not_leave_gaps() {
    let text = "first\n\n────────\n\n\nsecond";
    assert_eq!(sanitizer().sanitize(text), "first\n\nsecond");
}

// ── Decorative and banner lines ──────────────────────────────────────────────

/// Text made only of decoration and banners sanitizes to nothing.
#[test]
fn noise_only_text_becomes_empty() {
    let text = concat!(
        "╭──────────────╮\n",
        "══════════\n",
        "----------\n",
        "⠋ Thinking\n",
        " 45%|████▌     | 9/20\n",
        "2025-01-31 12:00:00,123 [INFO] amplifier_bridge: session started\n",
        "Preparing bundle (may download modules)...\n",
        "Loading provider…\n",
        "Session ID: 6f1c\n",
        "Model: claude\n",
        "[status] ready\n",
    );
    assert_eq!(sanitizer().sanitize(text), "");
}

/// Banner lines are removed while surrounding content is kept.
#[test]
fn banners_are_removed_between_content() {
    let text = "Answer start\nSession: abc\nAnswer end";
    assert_eq!(sanitizer().sanitize(text), "Answer start\nAnswer end");
}

/// Answer prose that happens to start like a header is kept.
#[test]
fn header_like_prose_is_kept() {
    let text = "Model: the transformer\nSession: a sequence of turns";
    assert_eq!(sanitizer().sanitize(text), text);
}

/// Box-drawn content lines are not treated as pure decoration.
#[test]
fn boxed_content_is_kept() {
    assert_eq!(sanitizer().sanitize("│ result: 42 │"), "│ result: 42 │");
}

/// Short dashes such as list bullets are not rule lines.
#[test]
fn list_bullets_are_not_rules() {
    let s = sanitizer();
    assert!(!s.is_noise("- item"));
    assert!(!s.is_noise("-- note"));
    assert!(s.is_noise("---"));
}

/// Lifecycle words only count as banners when they end in an ellipsis.
#[test]
fn lifecycle_words_need_ellipsis() {
    let s = sanitizer();
    assert!(s.is_noise("Loading modules..."));
    assert!(!s.is_noise("Loading modules is slow in this setup."));
}

/// The built-in list is non-empty and every entry compiles.
#[test]
fn default_patterns_compile() {
    assert!(!DEFAULT_BANNER_PATTERNS.is_empty());
    for pattern in DEFAULT_BANNER_PATTERNS {
        assert!(regex::Regex::new(pattern).is_ok(), "{pattern}");
    }
}

// ── Extra patterns ───────────────────────────────────────────────────────────

/// Configured extra patterns extend the built-in list.
#[test]
fn extra_patterns_extend_the_list() {
    let s = Sanitizer::new(&["^DEBUG:".to_owned()]).expect("compile");
    assert_eq!(s.sanitize("DEBUG: cache hit\nreal output"), "real output");
    assert_eq!(sanitizer().sanitize("DEBUG: cache hit"), "DEBUG: cache hit");
}

/// An invalid extra pattern is a configuration error.
#[test]
fn invalid_extra_pattern_is_config_error() {
    let err = Sanitizer::new(&["(unclosed".to_owned()]).expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
    assert!(err.to_string().contains("(unclosed"));
}
