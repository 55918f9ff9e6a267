//! Bounded pool of worker sessions.
//!
//! The pool owns every `WorkerInstance` it spawns: it races session
//! creation against a timeout, mirrors session events into worker status,
//! and tears workers down with a short grace period.

mod session;

pub use session::{Session, SessionEvent, SessionFactory, SessionOptions};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{MAX_WORKERS, MIN_WORKERS, WorkerPoolConfig};
use crate::error::{Result, SwarmError};

const TERMINATE_GRACE: Duration = Duration::from_millis(100);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Worker lifecycle status. Transitions move monotonically toward
/// `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
    Error,
    Terminated,
}

impl WorkerStatus {
    /// True when the worker is not mid-task.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Idle | Self::Error | Self::Terminated)
    }
}

/// Snapshot of one pooled worker.
#[derive(Debug, Clone)]
pub struct WorkerInstance {
    pub id: String,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub status: WorkerStatus,
}

/// Spawn parameters; the worker id is the task id it will execute (or a
/// synthesized reviewer id).
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task_id: String,
    pub working_dir: PathBuf,
    pub system_prompt: String,
    pub worker_type: Option<String>,
    pub mcp_servers: Vec<String>,
}

impl SpawnRequest {
    pub fn new(task_id: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_id: task_id.into(),
            working_dir: working_dir.into(),
            system_prompt: String::new(),
            worker_type: None,
            mcp_servers: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_worker_type(mut self, worker_type: impl Into<String>) -> Self {
        self.worker_type = Some(worker_type.into());
        self
    }
}

struct WorkerEntry {
    working_dir: PathBuf,
    created_at: DateTime<Utc>,
    status: WorkerStatus,
    session: Arc<dyn Session>,
    watcher: JoinHandle<()>,
}

/// Bounded creation and teardown of worker sessions.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    factory: Arc<dyn SessionFactory>,
    workers: Arc<RwLock<HashMap<String, WorkerEntry>>>,
    /// Ids mid-spawn, so concurrent spawns cannot double-book.
    reservations: Mutex<std::collections::HashSet<String>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, factory: Arc<dyn SessionFactory>) -> Result<Self> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&config.max_workers) {
            return Err(SwarmError::Config(format!(
                "max_workers must be in [{}, {}], got {}",
                MIN_WORKERS, MAX_WORKERS, config.max_workers
            )));
        }
        Ok(Self {
            config,
            factory,
            workers: Arc::new(RwLock::new(HashMap::new())),
            reservations: Mutex::new(std::collections::HashSet::new()),
        })
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    pub fn size(&self) -> usize {
        self.workers.read().len()
    }

    /// Spawn a worker for `request.task_id`.
    ///
    /// Fails with `LimitExceeded` when the pool is full, `DuplicateId`
    /// when the id is already tracked, and `SpawnTimeout` when the
    /// factory does not produce a session in time (best-effort cleanup of
    /// the late session when `auto_cleanup` is set).
    pub async fn spawn(&self, request: SpawnRequest) -> Result<WorkerInstance> {
        let id = request.task_id.clone();
        {
            let workers = self.workers.read();
            let mut reservations = self.reservations.lock();
            let current = workers.len() + reservations.len();
            if current >= self.config.max_workers {
                return Err(SwarmError::LimitExceeded {
                    current,
                    max: self.config.max_workers,
                });
            }
            if workers.contains_key(&id) || !reservations.insert(id.clone()) {
                return Err(SwarmError::DuplicateId(id));
            }
        }

        let result = self.spawn_reserved(&request).await;
        self.reservations.lock().remove(&id);
        result
    }

    async fn spawn_reserved(&self, request: &SpawnRequest) -> Result<WorkerInstance> {
        let options = SessionOptions {
            worker_id: request.task_id.clone(),
            instructions: request.system_prompt.clone(),
            workspace_path: request.working_dir.clone(),
            worker_type: request
                .worker_type
                .clone()
                .unwrap_or_else(|| "worker".to_string()),
            mcp_servers: request.mcp_servers.clone(),
            ..SessionOptions::default()
        };

        let factory = Arc::clone(&self.factory);
        let mut create_task = tokio::spawn(async move { factory.create(options).await });

        let timeout = Duration::from_millis(self.config.spawn_timeout_ms);
        let session = match tokio::time::timeout(timeout, &mut create_task).await {
            Ok(Ok(Ok(session))) => session,
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(join_err)) => {
                return Err(SwarmError::Session(format!(
                    "session creation panicked: {}",
                    join_err
                )));
            }
            Err(_) => {
                if self.config.auto_cleanup {
                    // The factory may still finish; reap whatever it
                    // produces.
                    tokio::spawn(async move {
                        if let Ok(Ok(session)) = create_task.await {
                            session.abort();
                            if let Err(e) = session.dispose().await {
                                debug!(error = %e, "Late session dispose failed");
                            }
                        }
                    });
                } else {
                    create_task.abort();
                }
                return Err(SwarmError::SpawnTimeout {
                    worker_id: request.task_id.clone(),
                    timeout_ms: self.config.spawn_timeout_ms,
                });
            }
        };

        let created_at = Utc::now();
        let watcher = spawn_status_watcher(
            Arc::clone(&self.workers),
            request.task_id.clone(),
            session.subscribe(),
        );

        let entry = WorkerEntry {
            working_dir: request.working_dir.clone(),
            created_at,
            status: WorkerStatus::Idle,
            session,
            watcher,
        };
        self.workers.write().insert(request.task_id.clone(), entry);

        info!(worker_id = %request.task_id, dir = %request.working_dir.display(), "Worker spawned");
        Ok(WorkerInstance {
            id: request.task_id.clone(),
            working_dir: request.working_dir.clone(),
            created_at,
            status: WorkerStatus::Idle,
        })
    }

    /// Tear down one worker. Idempotent: terminating an absent id is a
    /// no-op. The entry is removed even when teardown steps fail.
    pub async fn terminate(&self, id: &str) {
        let session = {
            let mut workers = self.workers.write();
            let Some(entry) = workers.get_mut(id) else {
                return;
            };
            entry.status = WorkerStatus::Terminated;
            Arc::clone(&entry.session)
        };

        session.abort();
        tokio::time::sleep(TERMINATE_GRACE).await;
        if let Err(e) = session.dispose().await {
            warn!(worker_id = %id, error = %e, "Session dispose failed");
        }

        if let Some(entry) = self.workers.write().remove(id) {
            entry.watcher.abort();
        }
        debug!(worker_id = %id, "Worker terminated");
    }

    /// Terminate every worker in parallel; failures are logged, never
    /// propagated.
    pub async fn cleanup(&self) {
        let ids: Vec<String> = self.workers.read().keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "Cleaning up worker pool");
        join_all(ids.iter().map(|id| self.terminate(id))).await;
    }

    pub fn get(&self, id: &str) -> Option<WorkerInstance> {
        self.workers.read().get(id).map(|entry| WorkerInstance {
            id: id.to_string(),
            working_dir: entry.working_dir.clone(),
            created_at: entry.created_at,
            status: entry.status,
        })
    }

    pub fn status_of(&self, id: &str) -> Option<WorkerStatus> {
        self.workers.read().get(id).map(|entry| entry.status)
    }

    /// Workers currently executing (status `Busy`).
    pub fn active(&self) -> Vec<WorkerInstance> {
        self.workers
            .read()
            .iter()
            .filter(|(_, entry)| entry.status == WorkerStatus::Busy)
            .map(|(id, entry)| WorkerInstance {
                id: id.clone(),
                working_dir: entry.working_dir.clone(),
                created_at: entry.created_at,
                status: entry.status,
            })
            .collect()
    }

    /// Resolve once every worker has settled. Polls at a short cadence;
    /// an empty pool resolves immediately.
    pub async fn wait_for_all(&self) {
        loop {
            let all_settled = self
                .workers
                .read()
                .values()
                .all(|entry| entry.status.is_settled());
            if all_settled {
                return;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

/// Mirror session lifecycle events into worker status. A terminated
/// worker never transitions again.
fn spawn_status_watcher(
    workers: Arc<RwLock<HashMap<String, WorkerEntry>>>,
    worker_id: String,
    mut events: broadcast::Receiver<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(worker_id = %worker_id, skipped = n, "Session event stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let next = match event {
                SessionEvent::Started => WorkerStatus::Busy,
                SessionEvent::Completed => WorkerStatus::Idle,
                SessionEvent::Aborted | SessionEvent::ToolFailed => WorkerStatus::Error,
            };

            let mut workers = workers.write();
            match workers.get_mut(&worker_id) {
                Some(entry) if entry.status != WorkerStatus::Terminated => {
                    debug!(worker_id = %worker_id, ?event, ?next, "Worker status transition");
                    entry.status = next;
                }
                Some(_) => {}
                None => break,
            }
        }
    })
}
