//! The execution driver.
//!
//! One logical task drives the run: it polls graph readiness, asks the
//! strategy which ready tasks to dispatch, spawns workers, hands each its
//! assignment over the channel, and advances on completion messages. All
//! mutable run state lives behind a single mutex.

mod events;

pub use events::SchedulerEvent;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelEvent, MessageKind, MessageServer, TaskAssignmentPayload, TaskCompletedPayload,
    TaskFailedPayload, WireMessage,
};
use crate::config::{SchedulerConfig, WorkspaceConfig};
use crate::error::{Result, SwarmError};
use crate::graph::{TaskGraph, TaskSpec};
use crate::pool::{SpawnRequest, WorkerPool};
use crate::ratelimit::RateLimiter;
use crate::strategy::SchedulingStrategy;
use crate::workspace::WorkspaceValidator;

const ORCHESTRATOR_ID: &str = "orchestrator";
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Completion signals routed from the message channel to the driver.
#[derive(Debug)]
enum TaskOutcome {
    Completed { task_id: String },
    Failed { task_id: String, error: String },
}

struct RunState {
    graph: TaskGraph,
    /// Task id to worker id for every live assignment.
    worker_mapping: HashMap<String, String>,
    /// What each running task was charged, so completion refunds exactly
    /// that amount.
    rpm_charges: HashMap<String, u32>,
    current_rpm: u32,
}

/// Drives a task DAG to completion over a worker pool and a message
/// channel.
pub struct Scheduler {
    config: SchedulerConfig,
    state: Mutex<RunState>,
    pool: Arc<WorkerPool>,
    channel: Arc<MessageServer>,
    strategy: Box<dyn SchedulingStrategy>,
    limiter: Option<(Arc<RateLimiter>, String)>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Validate the DAG and the workspace assignments, then build the
    /// scheduler. Construction fails loudly on either.
    pub fn new(
        tasks: Vec<TaskSpec>,
        config: SchedulerConfig,
        workspace: &WorkspaceConfig,
        pool: Arc<WorkerPool>,
        channel: Arc<MessageServer>,
    ) -> Result<Self> {
        let report = WorkspaceValidator::new(workspace).validate(&tasks);
        if !report.is_valid {
            return Err(SwarmError::WorkspaceConflict(report.conflicts));
        }

        let graph = TaskGraph::new(tasks)?;
        let strategy = config
            .strategy
            .build(config.max_rpm, config.estimated_rpm_per_task);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            state: Mutex::new(RunState {
                graph,
                worker_mapping: HashMap::new(),
                rpm_charges: HashMap::new(),
                current_rpm: 0,
            }),
            pool,
            channel,
            strategy,
            limiter: None,
            events,
        })
    }

    /// Attach a rate limiter; assignments are tracked against `provider`.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>, provider: impl Into<String>) -> Self {
        self.limiter = Some((limiter, provider.into()));
        self
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> crate::graph::GraphStats {
        self.state.lock().graph.stats()
    }

    pub fn current_rpm(&self) -> u32 {
        self.state.lock().current_rpm
    }

    fn emit(&self, event: SchedulerEvent) {
        debug!(event = event.name(), "Scheduler event");
        let _ = self.events.send(event);
    }

    /// Run the DAG to completion.
    ///
    /// Returns after emitting `Completed`, or without it when a failed
    /// task has left the graph permanently stuck (dependents of a failed
    /// task never become ready, and this core does not retry).
    pub async fn run(&self) -> Result<()> {
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let router = spawn_outcome_router(Arc::clone(&self.channel), outcome_tx);

        self.emit(SchedulerEvent::Started);
        info!(tasks = self.state.lock().graph.task_count(), "Run started");

        let result = self.drive(&mut outcome_rx).await;
        router.abort();

        match &result {
            Ok(true) => self.emit(SchedulerEvent::Completed),
            Ok(false) => {
                warn!("Run stopped with a stuck graph; completion withheld");
            }
            Err(e) => self.emit(SchedulerEvent::Error {
                message: e.to_string(),
            }),
        }
        result.map(|_| ())
    }

    /// The main loop. `Ok(true)` when every task completed, `Ok(false)`
    /// when the graph can no longer make progress.
    async fn drive(&self, outcomes: &mut mpsc::UnboundedReceiver<TaskOutcome>) -> Result<bool> {
        loop {
            let (ready, available, running, all_complete, pick) = {
                let state = self.state.lock();
                let ready = state.graph.ready_tasks();
                let running = state.graph.running_count();
                let available = self.pool.max_workers().saturating_sub(running);
                let pick = if ready.is_empty() || available == 0 {
                    Vec::new()
                } else {
                    self.strategy.select_tasks(
                        &ready,
                        available,
                        Some(state.current_rpm),
                        Some(&state.graph),
                    )
                };
                (
                    ready,
                    available,
                    running,
                    state.graph.all_complete(),
                    pick,
                )
            };

            if all_complete {
                return Ok(true);
            }

            if pick.is_empty() {
                if running == 0 {
                    if ready.is_empty() {
                        // A failed task is blocking every remaining node.
                        warn!("No running or ready tasks remain; graph is stuck");
                        return Ok(false);
                    }
                    if available == 0 {
                        // max_workers is at least 2, so zero slots with
                        // nothing running cannot happen.
                        return Err(SwarmError::Other(
                            "no worker slots available with an idle pool".into(),
                        ));
                    }
                    // Rate-limited with nothing in flight: nothing will
                    // ever refund headroom, so the graph is stuck too.
                    warn!("Strategy selected nothing with an idle pool; graph is stuck");
                    return Ok(false);
                }

                // Wait for the next completion, then re-evaluate.
                match outcomes.recv().await {
                    Some(outcome) => self.handle_outcome(outcome).await,
                    None => {
                        return Err(SwarmError::Channel(
                            "completion stream closed while tasks were running".into(),
                        ));
                    }
                }
                continue;
            }

            for task_id in pick {
                if let Err(e) = self.assign(&task_id).await {
                    warn!(task_id = %task_id, error = %e, "Assignment failed");
                    self.state.lock().graph.mark_failed(&task_id);
                    self.emit(SchedulerEvent::TaskAssignFailed {
                        task_id,
                        error: e.to_string(),
                    });
                }
            }

            // Drain any completions that arrived while dispatching.
            while let Ok(outcome) = outcomes.try_recv() {
                self.handle_outcome(outcome).await;
            }
        }
    }

    /// Spawn a worker for the task, hand it the assignment, and charge
    /// the RPM estimate. Failures leave the RPM counter untouched.
    async fn assign(&self, task_id: &str) -> Result<()> {
        let (workspace, instructions, worker_type, estimated_rpm) = {
            let state = self.state.lock();
            let node = state
                .graph
                .get(task_id)
                .ok_or_else(|| SwarmError::TaskNotFound(task_id.to_string()))?;
            (
                node.spec.workspace_path.clone(),
                node.spec.instructions.clone(),
                node.spec.worker_type.clone(),
                node.spec
                    .estimated_rpm
                    .unwrap_or(self.config.estimated_rpm_per_task),
            )
        };

        let mut request = SpawnRequest::new(task_id, PathBuf::from(&workspace))
            .with_system_prompt(instructions.clone());
        if let Some(worker_type) = &worker_type {
            request = request.with_worker_type(worker_type.clone());
        }
        let worker = self.pool.spawn(request).await?;

        // Record the assignment before the handshake so completion
        // messages racing the send still resolve.
        let started = {
            let mut state = self.state.lock();
            let started = state.graph.start(task_id);
            if started.is_ok() {
                state
                    .worker_mapping
                    .insert(task_id.to_string(), worker.id.clone());
            }
            started
        };
        if let Err(e) = started {
            self.pool.terminate(&worker.id).await;
            return Err(e);
        }

        let send_result = self.send_assignment(task_id, &worker.id, &instructions, &workspace, worker_type).await;
        if let Err(e) = send_result {
            // The worker never got its instructions; reclaim the slot.
            self.pool.terminate(&worker.id).await;
            let mut state = self.state.lock();
            state.worker_mapping.remove(task_id);
            return Err(e);
        }

        {
            let mut state = self.state.lock();
            state.current_rpm += estimated_rpm;
            state.rpm_charges.insert(task_id.to_string(), estimated_rpm);
        }
        if let Some((limiter, provider)) = &self.limiter {
            limiter.track(provider, estimated_rpm);
        }

        info!(task_id = %task_id, worker_id = %worker.id, "Task assigned");
        self.emit(SchedulerEvent::TaskAssigned {
            task_id: task_id.to_string(),
            worker_id: worker.id,
        });
        Ok(())
    }

    async fn send_assignment(
        &self,
        task_id: &str,
        worker_id: &str,
        instructions: &str,
        workspace: &str,
        worker_type: Option<String>,
    ) -> Result<()> {
        // A freshly spawned worker's socket may bind after spawn returns;
        // give it the channel's wait budget before sending.
        self.channel
            .wait_for_worker(worker_id, self.channel.message_timeout())
            .await?;

        let msg = WireMessage::task_assignment(
            ORCHESTRATOR_ID,
            worker_id,
            &TaskAssignmentPayload {
                task_id: task_id.to_string(),
                instructions: instructions.to_string(),
                workspace_path: workspace.to_string(),
                worker_type,
            },
        )?;
        let delivered = self.channel.send(worker_id, msg).await?;
        if !delivered {
            return Err(SwarmError::SendFailure(format!(
                "worker {} has no bound connection",
                worker_id
            )));
        }
        Ok(())
    }

    async fn handle_outcome(&self, outcome: TaskOutcome) {
        let (task_id, worker_id, event) = {
            let mut state = self.state.lock();
            match outcome {
                TaskOutcome::Completed { task_id } => {
                    if state.graph.get(&task_id).is_none() {
                        debug!(task_id = %task_id, "Completion for unknown task ignored");
                        return;
                    }
                    state.graph.mark_completed(&task_id);
                    refund_rpm(&mut state, &task_id);
                    let worker_id = state.worker_mapping.remove(&task_id);
                    (
                        task_id.clone(),
                        worker_id,
                        SchedulerEvent::TaskCompleted { task_id },
                    )
                }
                TaskOutcome::Failed { task_id, error } => {
                    if state.graph.get(&task_id).is_none() {
                        debug!(task_id = %task_id, "Failure for unknown task ignored");
                        return;
                    }
                    state.graph.mark_failed(&task_id);
                    refund_rpm(&mut state, &task_id);
                    let worker_id = state.worker_mapping.remove(&task_id);
                    (
                        task_id.clone(),
                        worker_id,
                        SchedulerEvent::TaskFailed { task_id, error },
                    )
                }
            }
        };

        if let Some(worker_id) = worker_id {
            self.pool.terminate(&worker_id).await;
        }
        debug!(task_id = %task_id, "Task settled");
        self.emit(event);
    }
}

fn refund_rpm(state: &mut RunState, task_id: &str) {
    if let Some(charge) = state.rpm_charges.remove(task_id) {
        state.current_rpm = state.current_rpm.saturating_sub(charge);
    }
}

/// Translate completion/failure wire messages into driver outcomes.
fn spawn_outcome_router(
    channel: Arc<MessageServer>,
    tx: mpsc::UnboundedSender<TaskOutcome>,
) -> tokio::task::JoinHandle<()> {
    let mut events = channel.subscribe();
    tokio::spawn(async move {
        loop {
            let msg = match events.recv().await {
                Ok(ChannelEvent::Message(msg)) => msg,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Outcome router lagged behind the channel");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let outcome = match msg.kind {
                MessageKind::TaskCompleted => match msg.payload_as::<TaskCompletedPayload>() {
                    Ok(payload) => TaskOutcome::Completed {
                        task_id: payload.task_id,
                    },
                    Err(e) => {
                        warn!(error = %e, "Malformed task-completed payload");
                        continue;
                    }
                },
                MessageKind::TaskFailed => match msg.payload_as::<TaskFailedPayload>() {
                    Ok(payload) => TaskOutcome::Failed {
                        task_id: payload.task_id,
                        error: payload.error,
                    },
                    Err(e) => {
                        warn!(error = %e, "Malformed task-failed payload");
                        continue;
                    }
                },
                _ => continue,
            };

            if tx.send(outcome).is_err() {
                break;
            }
        }
    })
}
