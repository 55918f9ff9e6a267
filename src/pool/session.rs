//! Injected session seam backing each worker.
//!
//! The pool never reaches into a session's internals: sessions expose an
//! event stream and an abort flag, and the pool reacts to the stream.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;

/// Lifecycle events a backing session emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Started,
    Completed,
    Aborted,
    ToolFailed,
}

/// Options handed to the factory when a worker spawns.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Identity the worker announces on the message channel.
    pub worker_id: String,
    pub provider_config: Option<Value>,
    pub instructions: String,
    pub workspace_path: PathBuf,
    pub enable_diff: bool,
    pub enable_checkpoints: bool,
    pub start_task: bool,
    pub parallel_execution: bool,
    pub worker_type: String,
    pub mcp_servers: Vec<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            provider_config: None,
            instructions: String::new(),
            workspace_path: PathBuf::from("/"),
            enable_diff: false,
            enable_checkpoints: false,
            start_task: true,
            parallel_execution: true,
            worker_type: "worker".to_string(),
            mcp_servers: Vec::new(),
        }
    }
}

/// A running worker session.
#[async_trait]
pub trait Session: Send + Sync {
    /// Stream of lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    /// Set the abort flag and ask the session to stop.
    fn abort(&self);

    fn is_aborted(&self) -> bool;

    /// Optional teardown hook; the default does nothing.
    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

/// Creates backing sessions for spawned workers.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, options: SessionOptions) -> Result<Arc<dyn Session>>;
}
