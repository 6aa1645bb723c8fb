//! Path translation between the caller's filesystem and the worker's.
//!
//! When the interpreter runs under a different filesystem namespace (WSL on
//! a Windows host), drive-letter paths must be rewritten before they are sent
//! in `workspace_root` or `bundle_path`, and before the script path is handed
//! to the interpreter.

use std::path::Path;

use crate::config::PathStyle;

/// Translate `path` into the form the worker expects under `style`.
///
/// # Example
///
/// `C:\Users\dev\project` under [`PathStyle::Wsl`] → `/mnt/c/Users/dev/project`
#[must_use]
pub fn translate_path(path: &Path, style: PathStyle) -> String {
    let raw = path.to_string_lossy();
    match style {
        PathStyle::Native => raw.into_owned(),
        PathStyle::Wsl => to_wsl(&raw),
    }
}

/// Rewrite a Windows-style path for a WSL interpreter.
///
/// - `X:\rest` or `X:/rest` → `/mnt/x/rest`
/// - `\\wsl$\Distro\rest` or `\\wsl.localhost\Distro\rest` → `/rest`
/// - a leading `\\?\` verbatim prefix is dropped first
/// - anything else has its backslashes turned into forward slashes
fn to_wsl(raw: &str) -> String {
    let forward = raw.replace('\\', "/");
    // Verbatim prefix produced by `canonicalize` on Windows.
    let forward = forward.strip_prefix("//?/").unwrap_or(&forward).to_owned();

    if let Some(rest) = strip_wsl_share(&forward) {
        return format!("/{rest}");
    }

    let bytes = forward.as_bytes();
    let has_drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if !has_drive {
        return forward;
    }

    let drive = char::from(bytes[0]).to_ascii_lowercase();
    let rest = forward[2..].trim_start_matches('/');
    if rest.is_empty() {
        format!("/mnt/{drive}")
    } else {
        format!("/mnt/{drive}/{rest}")
    }
}

/// Strip a `//wsl$/<distro>/` or `//wsl.localhost/<distro>/` share prefix.
fn strip_wsl_share(forward: &str) -> Option<&str> {
    let after_host = forward
        .strip_prefix("//wsl$/")
        .or_else(|| forward.strip_prefix("//wsl.localhost/"))?;
    let (_distro, rest) = after_host.split_once('/').unwrap_or((after_host, ""));
    Some(rest)
}
