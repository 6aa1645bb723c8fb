//! Output sanitizer for streamed worker text.
//!
//! Strips terminal control sequences and drops lines that are not meant for
//! the end user: rule lines, box-drawing borders, and banner lines matched by
//! a declarative pattern list. Pure and stateless: the same input always
//! yields the same output.

use regex::Regex;

use crate::{AppError, Result};

/// Built-in banner patterns. Extend through `sanitizer.extra_patterns`.
pub const DEFAULT_BANNER_PATTERNS: &[&str] = &[
    // Spinner frames.
    r"^\s*[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]",
    // Progress bars: `45%|████▌     | 9/20`.
    r"^\s*\d{1,3}%\s*\|",
    // Worker log records: `2025-01-31 12:00:00,123 [INFO] amplifier_bridge: …`.
    r"^\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?\s+\[(?:DEBUG|INFO|WARNING|ERROR|CRITICAL)\]",
    // Lifecycle progress: `Preparing bundle (may download modules)...`.
    r"(?i)^\s*(?:loading|preparing|creating|downloading|installing|resolving)\b.*(?:\.\.\.|…)\s*$",
    // Metadata headers carry a single-token value: `Session ID: 6f1c`.
    r"(?i)^\s*(?:session(?:\s+id)?|bundle|provider|model)\s*:\s*\S+\s*$",
    r"(?i)^\s*\[(?:status|progress|debug|info)\]",
];

/// Terminal escape sequences and stray C0 controls (tab and newline survive).
const CONTROL_PATTERN: &str =
    r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?|\x1b[@-_]|[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]";

/// Lines made only of rule or box-drawing characters.
const DECORATIVE_PATTERN: &str =
    r"^[\s\x{2500}-\x{259F}]*[\x{2500}-\x{259F}][\s\x{2500}-\x{259F}]*$|^\s*[-=_*~+]{3,}[\s\-=_*~+]*$";

/// Compiled sanitizer.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    control: Regex,
    decorative: Regex,
    blank_runs: Regex,
    banners: Vec<Regex>,
}

impl Sanitizer {
    /// Compile the built-in patterns plus `extra_patterns`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if any pattern fails to compile.
    pub fn new(extra_patterns: &[String]) -> Result<Self> {
        let banners = DEFAULT_BANNER_PATTERNS
            .iter()
            .copied()
            .chain(extra_patterns.iter().map(String::as_str))
            .map(compile)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            control: compile(CONTROL_PATTERN)?,
            decorative: compile(DECORATIVE_PATTERN)?,
            blank_runs: compile(r"\n{3,}")?,
            banners,
        })
    }

    /// Clean `text` for display.
    ///
    /// 1. Remove control sequences; carriage-return redraws become separate lines.
    /// 2. Drop decorative and banner lines; whitespace-only lines become empty.
    /// 3. Rejoin, collapse runs of three or more newlines to two, and drop
    ///    blank lines at both ends.
    #[must_use]
    pub fn sanitize(&self, text: &str) -> String {
        let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
        let stripped = self.control.replace_all(&normalized, "");

        let kept: Vec<&str> = stripped
            .split('\n')
            .filter_map(|line| {
                if line.trim().is_empty() {
                    Some("")
                } else if self.is_noise(line) {
                    None
                } else {
                    Some(line)
                }
            })
            .collect();

        let joined = kept.join("\n");
        self.blank_runs
            .replace_all(&joined, "\n\n")
            .trim_matches('\n')
            .to_owned()
    }

    /// Whether a non-blank line is decoration or a banner.
    #[must_use]
    pub fn is_noise(&self, line: &str) -> bool {
        self.decorative.is_match(line) || self.banners.iter().any(|re| re.is_match(line))
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|err| AppError::Config(format!("invalid sanitizer pattern `{pattern}`: {err}")))
}
