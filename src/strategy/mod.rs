//! Pluggable task-selection strategies for the scheduler.
//!
//! A strategy is a pure function from the ready set to the dispatch set;
//! it never mutates its inputs and holds no hidden state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::graph::TaskGraph;

/// Picks which ready tasks to dispatch this round.
pub trait SchedulingStrategy: Send + Sync {
    fn select_tasks(
        &self,
        ready: &[String],
        available_workers: usize,
        current_rpm: Option<u32>,
        graph: Option<&TaskGraph>,
    ) -> Vec<String>;

    fn name(&self) -> &'static str;
}

/// Strategy selector used by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    MaxParallel,
    RateAware,
    CriticalPath,
}

impl StrategyKind {
    pub fn build(self, max_rpm: u32, estimated_rpm_per_task: u32) -> Box<dyn SchedulingStrategy> {
        match self {
            Self::MaxParallel => Box::new(MaxParallel),
            Self::RateAware => Box::new(RateAware {
                max_rpm,
                estimated_rpm_per_task,
            }),
            Self::CriticalPath => Box::new(CriticalPath),
        }
    }
}

/// Dispatch as many ready tasks as there are free worker slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxParallel;

impl SchedulingStrategy for MaxParallel {
    fn select_tasks(
        &self,
        ready: &[String],
        available_workers: usize,
        _current_rpm: Option<u32>,
        _graph: Option<&TaskGraph>,
    ) -> Vec<String> {
        let n = ready.len().min(available_workers);
        ready[..n].to_vec()
    }

    fn name(&self) -> &'static str {
        "max-parallel"
    }
}

/// Dispatch only as many tasks as the remaining RPM headroom allows.
#[derive(Debug, Clone, Copy)]
pub struct RateAware {
    pub max_rpm: u32,
    pub estimated_rpm_per_task: u32,
}

impl SchedulingStrategy for RateAware {
    fn select_tasks(
        &self,
        ready: &[String],
        available_workers: usize,
        current_rpm: Option<u32>,
        _graph: Option<&TaskGraph>,
    ) -> Vec<String> {
        if self.estimated_rpm_per_task == 0 {
            return Vec::new();
        }
        let headroom = self.max_rpm.saturating_sub(current_rpm.unwrap_or(0));
        if headroom == 0 {
            return Vec::new();
        }
        let by_rate = (headroom / self.estimated_rpm_per_task) as usize;
        let n = ready.len().min(available_workers).min(by_rate);
        ready[..n].to_vec()
    }

    fn name(&self) -> &'static str {
        "rate-aware"
    }
}

/// Prefer tasks on the graph's critical path, in path order; everything
/// else keeps its input order. Without a graph this degrades to
/// [`MaxParallel`] semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CriticalPath;

impl SchedulingStrategy for CriticalPath {
    fn select_tasks(
        &self,
        ready: &[String],
        available_workers: usize,
        current_rpm: Option<u32>,
        graph: Option<&TaskGraph>,
    ) -> Vec<String> {
        let Some(graph) = graph else {
            return MaxParallel.select_tasks(ready, available_workers, current_rpm, None);
        };

        let critical_path = graph.critical_path();
        let path_rank: HashMap<&str, usize> = critical_path
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut ordered = ready.to_vec();
        // Stable sort: on-path ids first in path order, off-path ids keep
        // their relative input order.
        ordered.sort_by_key(|id| {
            path_rank
                .get(id.as_str())
                .copied()
                .unwrap_or(usize::MAX)
        });

        let n = ordered.len().min(available_workers);
        ordered.truncate(n);
        ordered
    }

    fn name(&self) -> &'static str {
        "critical-path"
    }
}
