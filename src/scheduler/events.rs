use serde::{Deserialize, Serialize};

/// Lifecycle events emitted by the scheduler, serial from the driver
/// task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SchedulerEvent {
    Started,
    TaskAssigned { task_id: String, worker_id: String },
    TaskCompleted { task_id: String },
    TaskFailed { task_id: String, error: String },
    TaskAssignFailed { task_id: String, error: String },
    Completed,
    Error { message: String },
}

impl SchedulerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::TaskAssigned { .. } => "task-assigned",
            Self::TaskCompleted { .. } => "task-completed",
            Self::TaskFailed { .. } => "task-failed",
            Self::TaskAssignFailed { .. } => "task-assign-failed",
            Self::Completed => "completed",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error { .. })
    }
}
