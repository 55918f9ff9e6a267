use thiserror::Error;

use crate::workspace::WorkspaceConflict;

#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Invalid task graph: {0}")]
    InvalidGraph(String),

    #[error("Workspace conflicts detected: {}", format_conflicts(.0))]
    WorkspaceConflict(Vec<WorkspaceConflict>),

    #[error("Worker pool limit exceeded: {current}/{max} workers")]
    LimitExceeded { current: usize, max: usize },

    #[error("Worker already exists: {0}")]
    DuplicateId(String),

    #[error("Worker spawn timed out after {timeout_ms}ms: {worker_id}")]
    SpawnTimeout { worker_id: String, timeout_ms: u64 },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Message send failed: {0}")]
    SendFailure(String),

    #[error("{0} was disposed")]
    Disposed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Review error: {0}")]
    Review(String),

    #[error("Spawn rejected: {0}")]
    SpawnRejected(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl SwarmError {
    /// True when the failure is a wait that ran out of time rather than a
    /// broken invariant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::SpawnTimeout { .. })
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed(_))
    }
}

fn format_conflicts(conflicts: &[WorkspaceConflict]) -> String {
    conflicts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, SwarmError>;
