//! Parallel execution core for a multi-agent coordinator.
//!
//! Decomposes a bounded task DAG into concurrent workers, dispatches them
//! over a loopback message channel, enforces per-provider rate limits,
//! isolates worker workspaces, and brokers an asynchronous review
//! protocol between producer and reviewer workers.

pub mod channel;
pub mod config;
pub mod error;
pub mod graph;
pub mod pool;
pub mod ratelimit;
pub mod review;
pub mod scheduler;
pub mod spawn;
pub mod strategy;
pub mod workspace;

pub use channel::{MessageClient, MessageKind, MessageServer, RemoteSink, WireMessage};
pub use config::SwarmConfig;
pub use error::{Result, SwarmError};
pub use graph::{TaskGraph, TaskSpec, TaskState};
pub use pool::{Session, SessionFactory, SpawnRequest, WorkerPool, WorkerStatus};
pub use ratelimit::{ProviderLimit, RateLimitEvent, RateLimiter};
pub use review::{ReviewCoordinator, ReviewRequest, ReviewVerdict, Specialization};
pub use scheduler::{Scheduler, SchedulerEvent};
pub use spawn::{ApprovalPrompt, AutoApprove, SpawnToolRequest, SpawnToolResponse};
pub use strategy::{CriticalPath, MaxParallel, RateAware, SchedulingStrategy, StrategyKind};
pub use workspace::{WorkspaceConflict, WorkspaceValidator};
