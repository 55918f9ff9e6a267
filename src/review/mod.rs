//! Asynchronous review brokering between producer workers and reviewer
//! workers.
//!
//! Reviewers are ordinary pool workers with a specialization prompt; one
//! live reviewer per specialization is reused across requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{
    ChannelEvent, MessageKind, MessageServer, ReviewApprovedPayload, ReviewRejectedPayload,
    ReviewRequestPayload, WireMessage,
};
use crate::error::{Result, SwarmError};
use crate::pool::{SpawnRequest, WorkerPool};

pub const DEFAULT_REVIEW_TIMEOUT: Duration = Duration::from_secs(300);

const DEFAULT_APPROVAL_FEEDBACK: &str = "Approved without comments";
const DEFAULT_REJECTION_FEEDBACK: &str = "Rejected without comments";

const SECURITY_KEYWORDS: &[&str] = &["auth", "security", "login", "password", "token", "encrypt"];
const PERFORMANCE_KEYWORDS: &[&str] = &["optimize", "performance", "cache", "query", "index", "batch"];

const SECURITY_REVIEWER_PROMPT: &str = r"You are a Security Reviewer Agent.

Review the submitted changes for vulnerabilities: injection, secret
handling, authentication and authorization gaps, unsafe input validation.
Reply with review-approved or review-rejected; list each finding as an
issue with a file reference. Do NOT modify files.";

const PERFORMANCE_REVIEWER_PROMPT: &str = r"You are a Performance Reviewer Agent.

Review the submitted changes for regressions: unnecessary allocation,
quadratic scans, missing batching, cache misuse, slow queries. Reply with
review-approved or review-rejected; list each finding as an issue with a
file reference. Do NOT modify files.";

const STYLE_REVIEWER_PROMPT: &str = r"You are a Style Reviewer Agent.

Review the submitted changes for clarity, naming, convention adherence,
and maintainability. Reply with review-approved or review-rejected; list
each finding as an issue with a file reference. Do NOT modify files.";

/// Reviewer specialization, inferred from the task id when not supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialization {
    Security,
    Performance,
    Style,
}

impl Specialization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Style => "style",
        }
    }

    /// Case-insensitive keyword match against the task id; anything
    /// unmatched reviews for style.
    pub fn infer(task_id: &str) -> Self {
        let lowered = task_id.to_lowercase();
        if SECURITY_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            Self::Security
        } else if PERFORMANCE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            Self::Performance
        } else {
            Self::Style
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Self::Security => SECURITY_REVIEWER_PROMPT,
            Self::Performance => PERFORMANCE_REVIEWER_PROMPT,
            Self::Style => STYLE_REVIEWER_PROMPT,
        }
    }
}

/// A worker's request for review of its output.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub task_id: String,
    pub worker_id: String,
    pub files_changed: Vec<String>,
    pub description: String,
    pub specialization: Option<Specialization>,
}

/// Returned as soon as the request is on the wire.
#[derive(Debug, Clone)]
pub struct ReviewTicket {
    pub review_id: String,
    pub reviewer_id: String,
    pub status: ReviewStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStatus {
    Pending,
}

/// Outcome of a resolved review.
#[derive(Debug, Clone)]
pub struct ReviewVerdict {
    pub approved: bool,
    pub reviewer_id: String,
    pub feedback: String,
    pub suggestions: Vec<String>,
    pub issues: Vec<String>,
}

/// Brokers review requests and resolutions over the message channel.
pub struct ReviewCoordinator {
    pool: Arc<WorkerPool>,
    channel: Arc<MessageServer>,
    active_reviewers: DashMap<Specialization, String>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ReviewVerdict>>>>,
    router: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ReviewCoordinator {
    pub fn new(pool: Arc<WorkerPool>, channel: Arc<MessageServer>) -> Self {
        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<ReviewVerdict>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let router = spawn_verdict_router(Arc::clone(&channel), Arc::clone(&pending));

        Self {
            pool,
            channel,
            active_reviewers: DashMap::new(),
            pending,
            router: Mutex::new(Some(router)),
            disposed: AtomicBool::new(false),
        }
    }

    /// Dispatch a `review-request` to a reviewer of the right
    /// specialization, spawning one when none is live. Returns without
    /// waiting for the verdict.
    pub async fn request_review(&self, request: ReviewRequest) -> Result<ReviewTicket> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SwarmError::Disposed("review coordinator".into()));
        }

        let specialization = request
            .specialization
            .unwrap_or_else(|| Specialization::infer(&request.task_id));
        let reviewer_id = self.ensure_reviewer(specialization).await?;

        let review_id = Uuid::new_v4().to_string();
        let msg = WireMessage::review_request(
            &request.worker_id,
            &reviewer_id,
            &ReviewRequestPayload {
                review_id: review_id.clone(),
                task_id: request.task_id.clone(),
                files: request.files_changed.clone(),
                description: request.description.clone(),
            },
        )?;

        self.channel
            .wait_for_worker(&reviewer_id, self.channel.message_timeout())
            .await?;
        let delivered = self.channel.send(&reviewer_id, msg).await?;
        if !delivered {
            return Err(SwarmError::SendFailure(format!(
                "reviewer {} has no bound connection",
                reviewer_id
            )));
        }

        info!(
            task_id = %request.task_id,
            reviewer_id = %reviewer_id,
            specialization = specialization.as_str(),
            "Review requested"
        );
        Ok(ReviewTicket {
            review_id,
            reviewer_id,
            status: ReviewStatus::Pending,
        })
    }

    /// Reuse the live reviewer for this specialization or spawn a fresh
    /// one rooted at `/`.
    async fn ensure_reviewer(&self, specialization: Specialization) -> Result<String> {
        if let Some(entry) = self.active_reviewers.get(&specialization) {
            if self.pool.get(entry.value()).is_some() {
                return Ok(entry.value().clone());
            }
        }

        let short_uuid = Uuid::new_v4().simple().to_string()[..8].to_string();
        let reviewer_id = format!("reviewer-{}-{}", specialization.as_str(), short_uuid);

        self.pool
            .spawn(
                SpawnRequest::new(reviewer_id.clone(), "/")
                    .with_system_prompt(specialization.system_prompt())
                    .with_worker_type("reviewer"),
            )
            .await?;

        self.active_reviewers
            .insert(specialization, reviewer_id.clone());
        debug!(reviewer_id = %reviewer_id, "Reviewer spawned");
        Ok(reviewer_id)
    }

    /// Wait for the task's review to resolve. At most one outstanding
    /// wait per task id; a timeout removes the record.
    pub async fn wait_for_approval(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ReviewVerdict> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SwarmError::Disposed("review coordinator".into()));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(task_id) {
                return Err(SwarmError::Review(format!(
                    "a review wait is already outstanding for task {}",
                    task_id
                )));
            }
            pending.insert(task_id.to_string(), tx);
        }

        let timeout = timeout.unwrap_or(DEFAULT_REVIEW_TIMEOUT);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(verdict)) => Ok(verdict),
            Ok(Err(_)) => Err(SwarmError::Disposed("review coordinator".into())),
            Err(_) => {
                self.pending.lock().remove(task_id);
                Err(SwarmError::Timeout(format!(
                    "review of task {} did not resolve within {}ms",
                    task_id,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Reject every outstanding wait and forget the reviewer registry;
    /// later requests spawn fresh reviewers.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Review coordinator disposing");

        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        // Dropping the senders rejects the waits with a disposed error.
        self.pending.lock().clear();
        self.active_reviewers.clear();
    }
}

impl Drop for ReviewCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Resolve pending waits from `review-approved` / `review-rejected`
/// traffic. Verdicts for unknown task ids are logged and discarded.
fn spawn_verdict_router(
    channel: Arc<MessageServer>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ReviewVerdict>>>>,
) -> JoinHandle<()> {
    let mut events = channel.subscribe();
    tokio::spawn(async move {
        loop {
            let msg = match events.recv().await {
                Ok(ChannelEvent::Message(msg)) => msg,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Verdict router lagged behind the channel");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let (task_id, verdict) = match msg.kind {
                MessageKind::ReviewApproved => match msg.payload_as::<ReviewApprovedPayload>() {
                    Ok(payload) => (
                        payload.task_id,
                        ReviewVerdict {
                            approved: true,
                            reviewer_id: msg.from,
                            feedback: payload
                                .feedback
                                .unwrap_or_else(|| DEFAULT_APPROVAL_FEEDBACK.to_string()),
                            suggestions: payload.suggestions,
                            issues: Vec::new(),
                        },
                    ),
                    Err(e) => {
                        warn!(error = %e, "Malformed review-approved payload");
                        continue;
                    }
                },
                MessageKind::ReviewRejected => match msg.payload_as::<ReviewRejectedPayload>() {
                    Ok(payload) => (
                        payload.task_id,
                        ReviewVerdict {
                            approved: false,
                            reviewer_id: msg.from,
                            feedback: payload
                                .feedback
                                .unwrap_or_else(|| DEFAULT_REJECTION_FEEDBACK.to_string()),
                            suggestions: Vec::new(),
                            issues: payload.issues,
                        },
                    ),
                    Err(e) => {
                        warn!(error = %e, "Malformed review-rejected payload");
                        continue;
                    }
                },
                _ => continue,
            };

            match pending.lock().remove(&task_id) {
                Some(tx) => {
                    if tx.send(verdict).is_err() {
                        debug!(task_id = %task_id, "Review waiter dropped before delivery");
                    }
                }
                None => {
                    debug!(task_id = %task_id, "Verdict for unknown task discarded");
                }
            }
        }
    })
}
