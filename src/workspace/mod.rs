//! Pre-flight validation of worker working directories.
//!
//! Two tasks must never share, nest, or wildcard-overlap their
//! workspaces; the validator reports every conflicting pair before the
//! scheduler dispatches anything.

mod patterns;

pub use patterns::{has_wildcard, pattern_matches, wildcard_base, wildcard_to_regex};

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::WorkspaceConfig;
use crate::graph::TaskSpec;

/// How two workspaces collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both paths normalize to the same directory.
    Identical,
    /// One path is an ancestor of the other.
    Nested,
    /// Wildcard patterns can match overlapping paths.
    WildcardOverlap,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identical => "identical",
            Self::Nested => "nested",
            Self::WildcardOverlap => "wildcard-overlap",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Error,
    Warning,
}

/// One conflicting pair of task workspaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConflict {
    pub task_a: String,
    pub task_b: String,
    pub path_a: String,
    pub path_b: String,
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
}

impl fmt::Display for WorkspaceConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) vs {} ({}): {}",
            self.task_a,
            self.path_a,
            self.task_b,
            self.path_b,
            self.kind.as_str()
        )
    }
}

/// Result of a validation pass.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub conflicts: Vec<WorkspaceConflict>,
    /// Task id to normalized workspace path.
    pub assignments: HashMap<String, String>,
}

/// Validates workspace assignments against sharing and nesting rules.
pub struct WorkspaceValidator {
    strict_mode: bool,
    allow_nested_dirs: bool,
    support_wildcards: bool,
    /// Probed once at construction from the platform.
    case_insensitive: bool,
}

impl WorkspaceValidator {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            strict_mode: config.strict_mode,
            allow_nested_dirs: config.allow_nested_dirs,
            support_wildcards: config.support_wildcards,
            case_insensitive: platform_case_insensitive(),
        }
    }

    #[cfg(test)]
    fn with_case_insensitive(mut self, value: bool) -> Self {
        self.case_insensitive = value;
        self
    }

    /// Canonical form of a workspace path.
    ///
    /// Backslashes become slashes, runs of slashes collapse, the trailing
    /// slash drops (except for `/` itself), a leading slash is added when
    /// missing, and the empty string means `/`. On case-insensitive
    /// filesystems the result is lower-cased. Normalizing a normalized
    /// path returns the same string.
    pub fn normalize(&self, path: &str) -> String {
        let mut out = String::with_capacity(path.len() + 1);
        let mut last_was_slash = false;

        if !path.starts_with('/') && !path.starts_with('\\') {
            out.push('/');
        }
        for c in path.chars() {
            let c = if c == '\\' { '/' } else { c };
            if c == '/' {
                if last_was_slash {
                    continue;
                }
                last_was_slash = true;
            } else {
                last_was_slash = false;
            }
            out.push(c);
        }

        if out.len() > 1 && out.ends_with('/') {
            out.pop();
        }
        if out.is_empty() {
            out.push('/');
        }
        if self.case_insensitive {
            out = out.to_lowercase();
        }
        out
    }

    /// Check every pair of task workspaces for conflicts.
    pub fn validate(&self, tasks: &[TaskSpec]) -> ValidationReport {
        let normalized: Vec<(String, String)> = tasks
            .iter()
            .map(|t| (t.id.clone(), self.normalize(&t.workspace_path)))
            .collect();

        let mut conflicts = Vec::new();
        for i in 0..normalized.len() {
            for j in (i + 1)..normalized.len() {
                let (id_a, path_a) = &normalized[i];
                let (id_b, path_b) = &normalized[j];
                if let Some(kind) = self.conflict_between(path_a, path_b) {
                    conflicts.push(WorkspaceConflict {
                        task_a: id_a.clone(),
                        task_b: id_b.clone(),
                        path_a: path_a.clone(),
                        path_b: path_b.clone(),
                        kind,
                        severity: ConflictSeverity::Error,
                    });
                }
            }
        }

        let is_valid = if self.strict_mode {
            conflicts.is_empty()
        } else {
            !conflicts
                .iter()
                .any(|c| c.severity == ConflictSeverity::Error)
        };

        ValidationReport {
            is_valid,
            conflicts,
            assignments: normalized.into_iter().collect(),
        }
    }

    fn conflict_between(&self, a: &str, b: &str) -> Option<ConflictKind> {
        if a == b {
            return Some(ConflictKind::Identical);
        }

        if self.support_wildcards && (has_wildcard(a) || has_wildcard(b)) {
            if let Some(kind) = self.wildcard_overlap(a, b) {
                return Some(kind);
            }
        }

        if !self.allow_nested_dirs && is_nested(a, b) {
            return Some(ConflictKind::Nested);
        }

        None
    }

    fn wildcard_overlap(&self, a: &str, b: &str) -> Option<ConflictKind> {
        // Either pattern matching the other literal is an overlap.
        if has_wildcard(a) && pattern_matches(a, b) {
            return Some(ConflictKind::WildcardOverlap);
        }
        if has_wildcard(b) && pattern_matches(b, a) {
            return Some(ConflictKind::WildcardOverlap);
        }

        // Two patterns sharing a non-trivial base prefix can both match
        // paths under that base.
        if has_wildcard(a) && has_wildcard(b) {
            let base_a = wildcard_base(a);
            let base_b = wildcard_base(b);
            let shared = base_a.starts_with(base_b) || base_b.starts_with(base_a);
            if shared && base_a.len().min(base_b.len()) > 1 {
                return Some(ConflictKind::WildcardOverlap);
            }
        }

        None
    }

    /// Conflict-free fallback assignment: `/worker-1`, `/worker-2`, …
    pub fn suggest_assignments(&self, tasks: &[TaskSpec]) -> HashMap<String, String> {
        tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), format!("/worker-{}", i + 1)))
            .collect()
    }
}

/// True when one normalized path is an ancestor directory of the other.
/// `/` nests every other path.
fn is_nested(a: &str, b: &str) -> bool {
    if a == "/" || b == "/" {
        return true;
    }
    b.strip_prefix(a).is_some_and(|rest| rest.starts_with('/'))
        || a.strip_prefix(b).is_some_and(|rest| rest.starts_with('/'))
}

fn platform_case_insensitive() -> bool {
    cfg!(any(target_os = "windows", target_os = "macos"))
}
