//! Wildcard workspace patterns.
//!
//! `*` matches any run of characters except `/`; `**` matches across
//! separators. Conversion anchors the whole path.

use regex::Regex;

use crate::error::{Result, SwarmError};

pub fn has_wildcard(path: &str) -> bool {
    path.contains('*')
}

/// The literal prefix before the first `*`.
pub fn wildcard_base(path: &str) -> &str {
    match path.find('*') {
        Some(idx) => &path[..idx],
        None => path,
    }
}

/// Compile a workspace pattern into an anchored regex.
pub fn wildcard_to_regex(pattern: &str) -> Result<Regex> {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');

    Regex::new(&regex).map_err(|e| SwarmError::Other(format!("invalid workspace pattern: {}", e)))
}

/// True when `pattern` matches the literal `path`.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    match wildcard_to_regex(pattern) {
        Ok(regex) => regex.is_match(path),
        Err(_) => false,
    }
}
