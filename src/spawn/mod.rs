//! The spawn tool surface invoked by the outer agent.
//!
//! Validates the tool parameters, consults the approval prompt, and
//! spawns through the pool. The response is always a value: failures are
//! reported in the `error` field, never as a Rust error.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SwarmError;
use crate::pool::{SpawnRequest, WorkerPool};

/// Display cut-off for system prompts in user-facing approval text.
const PROMPT_DISPLAY_LIMIT: usize = 100;

/// Consulted before a spawn is authorized. Implementations may always
/// answer `true`.
#[async_trait]
pub trait ApprovalPrompt: Send + Sync {
    async fn ask(&self, kind: &str, message_json: &str) -> bool;
}

/// Accepts and approves every spawn.
pub struct AutoApprove;

#[async_trait]
impl ApprovalPrompt for AutoApprove {
    async fn ask(&self, _kind: &str, _message_json: &str) -> bool {
        true
    }
}

/// `mcpServers` arrives either as a JSON array of strings or as one
/// comma-separated string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpServerList {
    List(Vec<String>),
    Csv(String),
}

impl McpServerList {
    /// Split, trim, and drop empties.
    pub fn normalize(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            Self::List(items) => items.iter().map(String::as_str).collect(),
            Self::Csv(csv) => csv.split(',').collect(),
        };
        raw.iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Parameters of the spawn tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnToolRequest {
    pub task_id: String,
    pub workspace_path: String,
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<McpServerList>,
}

impl SpawnToolRequest {
    /// The system prompt as shown in user-facing text: cut at 100 chars
    /// with a `...` marker.
    pub fn display_prompt(&self) -> String {
        truncate_for_display(&self.system_prompt, PROMPT_DISPLAY_LIMIT)
    }

    /// Relative workspace paths resolve against the process cwd.
    pub fn resolved_workspace(&self) -> PathBuf {
        let path = Path::new(&self.workspace_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(path)
        }
    }

    fn validate(&self) -> Result<(), SwarmError> {
        if self.task_id.trim().is_empty() {
            return Err(SwarmError::SpawnRejected("taskId is required".into()));
        }
        if self.workspace_path.trim().is_empty() {
            return Err(SwarmError::SpawnRejected("workspacePath is required".into()));
        }
        if self.system_prompt.trim().is_empty() {
            return Err(SwarmError::SpawnRejected("systemPrompt is required".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnToolStatus {
    Spawned,
    Error,
}

/// Tool return shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnToolResponse {
    pub worker_id: String,
    pub status: SpawnToolStatus,
    pub workspace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpawnToolResponse {
    fn spawned(worker_id: String, workspace: String) -> Self {
        Self {
            worker_id,
            status: SpawnToolStatus::Spawned,
            workspace,
            error: None,
        }
    }

    fn error(worker_id: String, workspace: String, error: impl Into<String>) -> Self {
        Self {
            worker_id,
            status: SpawnToolStatus::Error,
            workspace,
            error: Some(error.into()),
        }
    }
}

/// Validate, ask for approval, and spawn.
pub async fn handle_spawn(
    pool: &WorkerPool,
    approval: &dyn ApprovalPrompt,
    request: SpawnToolRequest,
) -> SpawnToolResponse {
    let workspace = request.resolved_workspace();
    let workspace_display = workspace.display().to_string();

    if let Err(e) = request.validate() {
        return SpawnToolResponse::error(request.task_id, workspace_display, e.to_string());
    }

    let approval_payload = serde_json::json!({
        "taskId": request.task_id.clone(),
        "workspacePath": workspace_display.clone(),
        "systemPrompt": request.display_prompt(),
    });
    let approved = approval
        .ask("spawn-worker", &approval_payload.to_string())
        .await;
    if !approved {
        warn!(task_id = %request.task_id, "Spawn rejected by approval prompt");
        return SpawnToolResponse::error(
            request.task_id,
            workspace_display,
            "spawn was not approved",
        );
    }

    let mcp_servers = request
        .mcp_servers
        .as_ref()
        .map(McpServerList::normalize)
        .unwrap_or_default();

    let spawn_request = SpawnRequest {
        task_id: request.task_id.clone(),
        working_dir: workspace,
        system_prompt: request.system_prompt.clone(),
        worker_type: None,
        mcp_servers,
    };

    match pool.spawn(spawn_request).await {
        Ok(worker) => {
            info!(worker_id = %worker.id, "Worker spawned via tool");
            SpawnToolResponse::spawned(worker.id, workspace_display)
        }
        Err(e) => SpawnToolResponse::error(request.task_id, workspace_display, e.to_string()),
    }
}

fn truncate_for_display(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(task_id: &str, workspace: &str, prompt: &str) -> SpawnToolRequest {
        SpawnToolRequest {
            task_id: task_id.to_string(),
            workspace_path: workspace.to_string(),
            system_prompt: prompt.to_string(),
            mcp_servers: None,
        }
    }

    #[test]
    fn test_mcp_servers_accepts_array_or_csv() {
        let from_json: SpawnToolRequest = serde_json::from_str(
            r#"{"taskId":"t","workspacePath":"/w","systemPrompt":"p","mcpServers":["a"," b ",""]}"#,
        )
        .unwrap();
        assert_eq!(
            from_json.mcp_servers.unwrap().normalize(),
            vec!["a".to_string(), "b".to_string()]
        );

        let from_csv: SpawnToolRequest = serde_json::from_str(
            r#"{"taskId":"t","workspacePath":"/w","systemPrompt":"p","mcpServers":" a, b ,, c "}"#,
        )
        .unwrap();
        assert_eq!(
            from_csv.mcp_servers.unwrap().normalize(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_display_prompt_truncation() {
        let short = request("t", "/w", "short prompt");
        assert_eq!(short.display_prompt(), "short prompt");

        let long = request("t", "/w", &"x".repeat(150));
        let shown = long.display_prompt();
        assert_eq!(shown.chars().count(), 103);
        assert!(shown.ends_with("..."));
    }

    #[test]
    fn test_relative_workspace_resolves_against_cwd() {
        let req = request("t", "work/nested", "p");
        let resolved = req.resolved_workspace();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("work/nested"));

        let abs = request("t", "/already/abs", "p");
        assert_eq!(abs.resolved_workspace(), PathBuf::from("/already/abs"));
    }

    #[test]
    fn test_validation_requires_fields() {
        assert!(request("", "/w", "p").validate().is_err());
        assert!(request("t", "", "p").validate().is_err());
        assert!(request("t", "/w", " ").validate().is_err());
        assert!(request("t", "/w", "p").validate().is_ok());
    }

    #[test]
    fn test_response_serialization() {
        let response = SpawnToolResponse::spawned("w-1".into(), "/w".into());
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["workerId"], "w-1");
        assert_eq!(json["status"], "spawned");
        assert!(json.get("error").is_none());
    }

    mod tool {
        use super::*;
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        use tokio::sync::broadcast;

        use crate::config::WorkerPoolConfig;
        use crate::pool::{Session, SessionEvent, SessionFactory, SessionOptions};

        struct NullSession {
            events: broadcast::Sender<SessionEvent>,
            aborted: AtomicBool,
        }

        #[async_trait]
        impl Session for NullSession {
            fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
                self.events.subscribe()
            }

            fn abort(&self) {
                self.aborted.store(true, Ordering::Release);
            }

            fn is_aborted(&self) -> bool {
                self.aborted.load(Ordering::Acquire)
            }
        }

        struct NullFactory;

        #[async_trait]
        impl SessionFactory for NullFactory {
            async fn create(
                &self,
                _options: SessionOptions,
            ) -> crate::error::Result<Arc<dyn Session>> {
                let (events, _) = broadcast::channel(4);
                Ok(Arc::new(NullSession {
                    events,
                    aborted: AtomicBool::new(false),
                }))
            }
        }

        struct DenyAll;

        #[async_trait]
        impl ApprovalPrompt for DenyAll {
            async fn ask(&self, _kind: &str, _message_json: &str) -> bool {
                false
            }
        }

        fn pool() -> WorkerPool {
            WorkerPool::new(WorkerPoolConfig::default(), Arc::new(NullFactory)).unwrap()
        }

        #[tokio::test]
        async fn test_handle_spawn_success() {
            let pool = pool();
            let response =
                handle_spawn(&pool, &AutoApprove, request("task-1", "/work/task-1", "do it")).await;

            assert_eq!(response.status, SpawnToolStatus::Spawned);
            assert_eq!(response.worker_id, "task-1");
            assert!(pool.get("task-1").is_some());
        }

        #[tokio::test]
        async fn test_handle_spawn_denied_by_prompt() {
            let pool = pool();
            let response =
                handle_spawn(&pool, &DenyAll, request("task-1", "/work/task-1", "do it")).await;

            assert_eq!(response.status, SpawnToolStatus::Error);
            assert!(response.error.unwrap().contains("not approved"));
            assert!(pool.get("task-1").is_none());
        }

        #[tokio::test]
        async fn test_handle_spawn_duplicate_reports_error() {
            let pool = pool();
            let first =
                handle_spawn(&pool, &AutoApprove, request("task-1", "/work/a", "p")).await;
            assert_eq!(first.status, SpawnToolStatus::Spawned);

            let second =
                handle_spawn(&pool, &AutoApprove, request("task-1", "/work/b", "p")).await;
            assert_eq!(second.status, SpawnToolStatus::Error);
            assert!(second.error.unwrap().contains("already exists"));
        }

        #[tokio::test]
        async fn test_handle_spawn_invalid_request_reports_error() {
            let pool = pool();
            let response = handle_spawn(&pool, &AutoApprove, request("", "/w", "p")).await;
            assert_eq!(response.status, SpawnToolStatus::Error);
        }
    }
}
