//! Path helpers for the virtual directory tree.
//!
//! Entries are addressed by `(dirname, name)`. Directory paths are absolute,
//! `/`-separated, without a trailing slash; the root is `/` and is never
//! stored as a row.

use super::error::{NamespaceError, NamespaceResult};

pub const ROOT: &str = "/";

const MAX_PATH_LEN: usize = 1024;

/// Normalize a directory path: ensure a leading `/`, drop a trailing `/`,
/// and reject empty, `.` or `..` segments.
pub fn normalize_dir(dir: &str) -> NamespaceResult<String> {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(ROOT.to_string());
    }
    if trimmed.len() > MAX_PATH_LEN {
        return Err(NamespaceError::InvalidArgument("path too long".into()));
    }

    let relative = trimmed.strip_prefix('/').unwrap_or(trimmed);
    for segment in relative.split('/') {
        check_segment(segment)?;
    }
    Ok(format!("/{}", relative))
}

/// Validate a single entry name.
pub fn validate_name(name: &str) -> NamespaceResult<()> {
    if name.is_empty() {
        return Err(NamespaceError::InvalidArgument("object name is empty".into()));
    }
    if name.contains('/') {
        return Err(NamespaceError::InvalidArgument(format!(
            "object name `{}` contains a separator",
            name
        )));
    }
    check_segment(name)
}

fn check_segment(segment: &str) -> NamespaceResult<()> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(NamespaceError::InvalidArgument(format!(
            "invalid path segment `{}`",
            segment
        )));
    }
    if segment.bytes().any(|b| b.is_ascii_control()) {
        return Err(NamespaceError::InvalidArgument(
            "path contains control characters".into(),
        ));
    }
    Ok(())
}

/// True when `(dirname, name)` addresses the synthetic root.
pub fn is_root(dirname: &str, name: &str) -> bool {
    dirname.trim_end_matches('/').is_empty() && name.trim_matches('/').is_empty()
}

/// Normalize and validate an entry address, refusing the root.
pub fn normalize_entry(dirname: &str, name: &str) -> NamespaceResult<(String, String)> {
    if is_root(dirname, name) {
        return Err(NamespaceError::Root);
    }
    let dirname = normalize_dir(dirname)?;
    validate_name(name)?;
    Ok((dirname, name.to_string()))
}

pub fn join(dirname: &str, name: &str) -> String {
    if dirname == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", dirname, name)
    }
}

/// Split a full path into `(dirname, name)`.
pub fn split(path: &str) -> NamespaceResult<(String, String)> {
    let normalized = normalize_dir(path)?;
    if normalized == ROOT {
        return Err(NamespaceError::Root);
    }
    match normalized.rsplit_once('/') {
        Some(("", name)) => Ok((ROOT.to_string(), name.to_string())),
        Some((dirname, name)) => Ok((dirname.to_string(), name.to_string())),
        None => Err(NamespaceError::InvalidArgument(format!(
            "malformed path `{}`",
            path
        ))),
    }
}

/// Every ancestor directory of `dir` as `(dirname, name)`, outermost first,
/// `dir` itself included and the root excluded.
///
/// `/a/b/c` yields `("/", "a")`, `("/a", "b")`, `("/a/b", "c")`.
pub fn ancestors(dir: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut parent = ROOT.to_string();
    for segment in dir.split('/').filter(|s| !s.is_empty()) {
        let current = join(&parent, segment);
        out.push((parent, segment.to_string()));
        parent = current;
    }
    out
}

/// First segment below the root, used to scope the materialization lock.
pub fn first_segment(dir: &str) -> Option<&str> {
    dir.split('/').find(|s| !s.is_empty())
}
