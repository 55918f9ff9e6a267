//! Scripted worker sessions for end-to-end tests.
//!
//! Each spawned session runs a real `MessageClient` against the test
//! channel: it introduces itself, waits for its assignment, and replies
//! with a completion, a failure, or a review verdict as scripted.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use taskswarm::channel::{
    ChannelEvent, MessageClient, MessageKind, ReviewApprovedPayload, ReviewRequestPayload,
    TaskAssignmentPayload, TaskCompletedPayload, TaskFailedPayload, WireMessage,
};
use taskswarm::config::ChannelConfig;
use taskswarm::pool::{Session, SessionEvent, SessionFactory, SessionOptions};
use taskswarm::Result;

const ORCHESTRATOR_ID: &str = "orchestrator";
const SIMULATED_WORK: Duration = Duration::from_millis(20);

pub struct ScriptedSession {
    events: broadcast::Sender<SessionEvent>,
    aborted: AtomicBool,
    runner: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Session for ScriptedSession {
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        if let Some(runner) = self.runner.lock().take() {
            runner.abort();
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    async fn dispose(&self) -> Result<()> {
        if let Some(runner) = self.runner.lock().take() {
            runner.abort();
        }
        Ok(())
    }
}

/// Factory producing scripted workers connected to a real channel port.
pub struct ScriptedWorkerFactory {
    port: u16,
    channel_config: ChannelConfig,
    /// Task ids whose workers report failure instead of success.
    fail_tasks: HashSet<String>,
    create_count: AtomicUsize,
}

impl ScriptedWorkerFactory {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            channel_config: ChannelConfig::default(),
            fail_tasks: HashSet::new(),
            create_count: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, task_ids: &[&str]) -> Self {
        self.fail_tasks = task_ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SessionFactory for ScriptedWorkerFactory {
    async fn create(&self, options: SessionOptions) -> Result<Arc<dyn Session>> {
        self.create_count.fetch_add(1, Ordering::AcqRel);

        let (events, _) = broadcast::channel(16);
        let should_fail = self.fail_tasks.contains(&options.worker_id);
        let runner = tokio::spawn(run_worker(
            options.worker_id.clone(),
            self.port,
            self.channel_config.clone(),
            should_fail,
            events.clone(),
        ));

        Ok(Arc::new(ScriptedSession {
            events,
            aborted: AtomicBool::new(false),
            runner: Mutex::new(Some(runner)),
        }))
    }
}

async fn run_worker(
    worker_id: String,
    port: u16,
    config: ChannelConfig,
    should_fail: bool,
    session_events: broadcast::Sender<SessionEvent>,
) {
    let Ok(client) = MessageClient::connect(port, config).await else {
        let _ = session_events.send(SessionEvent::ToolFailed);
        return;
    };
    let mut inbound = client.subscribe();
    if client.introduce(&worker_id).await.is_err() {
        let _ = session_events.send(SessionEvent::ToolFailed);
        return;
    }

    loop {
        let msg = match inbound.recv().await {
            Ok(ChannelEvent::Message(msg)) if msg.to == worker_id => msg,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match msg.kind {
            MessageKind::TaskAssignment => {
                let Ok(payload) = msg.payload_as::<TaskAssignmentPayload>() else {
                    continue;
                };
                let _ = session_events.send(SessionEvent::Started);
                tokio::time::sleep(SIMULATED_WORK).await;

                let reply = if should_fail {
                    WireMessage::task_failed(
                        &worker_id,
                        ORCHESTRATOR_ID,
                        &TaskFailedPayload {
                            task_id: payload.task_id,
                            error: "scripted failure".to_string(),
                        },
                    )
                } else {
                    WireMessage::task_completed(
                        &worker_id,
                        ORCHESTRATOR_ID,
                        &TaskCompletedPayload {
                            task_id: payload.task_id,
                            result: Some("done".to_string()),
                            modified_files: Vec::new(),
                        },
                    )
                };
                if let Ok(reply) = reply {
                    let _ = client.send(&reply).await;
                }
                let _ = session_events.send(if should_fail {
                    SessionEvent::ToolFailed
                } else {
                    SessionEvent::Completed
                });
            }
            MessageKind::ReviewRequest => {
                let Ok(payload) = msg.payload_as::<ReviewRequestPayload>() else {
                    continue;
                };
                let reply = WireMessage::new(
                    MessageKind::ReviewApproved,
                    &worker_id,
                    &msg.from,
                    serde_json::to_value(ReviewApprovedPayload {
                        task_id: payload.task_id,
                        review_id: payload.review_id,
                        feedback: Some("ok".to_string()),
                        suggestions: Vec::new(),
                    })
                    .unwrap_or(serde_json::Value::Null),
                );
                let _ = client.send(&reply).await;
            }
            _ => {}
        }
    }
}
