use crate::error::StageError;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Compile a download name pattern. Patterns are full regexes matched
/// against the object's basename, anchored at both ends so `snow.*` does
/// not match `other_snow_file`.
pub fn compile_name_pattern(pattern: &str) -> Result<Regex, StageError> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| StageError::Parse(format!("invalid name pattern '{}': {}", pattern, e)))
}

/// Expand a local source path into concrete files, in lexicographic order.
///
/// A path without wildcards resolves to itself (failing NotFound when the
/// file is missing). `*` and `?` in the final component are matched against
/// the entries of the parent directory; wildcards in parent components are
/// not supported.
pub fn expand_local_source(source: &Path) -> Result<Vec<PathBuf>, StageError> {
    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StageError::Parse(format!("invalid source path: {}", source.display())))?;

    if !name.contains('*') && !name.contains('?') {
        if !source.is_file() {
            return Err(StageError::NotFound(format!(
                "local file not found: {}",
                source.display()
            )));
        }
        return Ok(vec![source.to_path_buf()]);
    }

    let dir = match source.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let matcher = wildcard_to_regex(name)?;

    let mut matches = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(entry_name) = entry.file_name().to_str() {
            if matcher.is_match(entry_name) {
                matches.push(entry.path());
            }
        }
    }
    // Discovery order is the deterministic outcome order for uploads.
    matches.sort();

    if matches.is_empty() {
        return Err(StageError::NotFound(format!(
            "no local files match: {}",
            source.display()
        )));
    }
    Ok(matches)
}

/// Translate a shell-style wildcard (`*`, `?`) into an anchored regex.
fn wildcard_to_regex(pattern: &str) -> Result<Regex, StageError> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
        .map_err(|e| StageError::Parse(format!("invalid wildcard '{}': {}", pattern, e)))
}
