//! Per-provider rolling-window request accounting.
//!
//! Requests are bucketed by second and summed over the trailing 60 s.
//! Crossing the warning threshold emits one event per crossing; reaching
//! the configured limit emits an exceeded event after every track.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

const WINDOW_MS: i64 = 60_000;
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_WARNING_RATIO: f64 = 0.92;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Configured limit for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderLimit {
    pub provider: String,
    pub requests_per_minute: u32,
    /// Defaults to 92% of the limit when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_threshold: Option<u32>,
}

impl ProviderLimit {
    pub fn new(provider: impl Into<String>, requests_per_minute: u32) -> Self {
        Self {
            provider: provider.into(),
            requests_per_minute,
            warning_threshold: None,
        }
    }

    pub fn with_warning_threshold(mut self, threshold: u32) -> Self {
        self.warning_threshold = Some(threshold);
        self
    }

    fn threshold(&self) -> u32 {
        self.warning_threshold
            .unwrap_or((self.requests_per_minute as f64 * DEFAULT_WARNING_RATIO).floor() as u32)
    }
}

/// Emitted on the limiter's event stream after tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    Warning {
        provider: String,
        current_rpm: u32,
        limit: u32,
        headroom: u32,
    },
    Exceeded {
        provider: String,
        current_rpm: u32,
        limit: u32,
    },
}

#[derive(Debug, Default)]
struct ProviderWindow {
    /// `(second_bucket, count)` pairs, oldest first.
    buckets: VecDeque<(u64, u32)>,
    warned: bool,
}

impl ProviderWindow {
    fn prune(&mut self, cutoff_ms: i64) {
        while let Some(&(bucket, _)) = self.buckets.front() {
            if (bucket as i64) * 1000 > cutoff_ms {
                break;
            }
            self.buckets.pop_front();
        }
    }

    fn sum(&self) -> u32 {
        self.buckets.iter().map(|(_, count)| count).sum()
    }
}

struct LimiterInner {
    limits: HashMap<String, ProviderLimit>,
    windows: Mutex<HashMap<String, ProviderWindow>>,
    events: broadcast::Sender<RateLimitEvent>,
    epoch: Instant,
}

impl LimiterInner {
    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Prune the provider window and return the trailing-60 s sum.
    fn rpm_locked(&self, windows: &mut HashMap<String, ProviderWindow>, provider: &str) -> u32 {
        let cutoff = self.now_ms() - WINDOW_MS;
        match windows.get_mut(provider) {
            Some(window) => {
                window.prune(cutoff);
                window.sum()
            }
            None => 0,
        }
    }

    fn sweep(&self) {
        let cutoff = self.now_ms() - WINDOW_MS;
        let mut windows = self.windows.lock();
        for (provider, window) in windows.iter_mut() {
            window.prune(cutoff);
            if window.warned {
                if let Some(limit) = self.limits.get(provider) {
                    if window.sum() < limit.threshold() {
                        debug!(provider = %provider, "Rate warning cleared by sweep");
                        window.warned = false;
                    }
                }
            }
        }
    }
}

/// Rolling-window rate limiter shared across producers.
///
/// Requires a tokio runtime: a single owned sweep task prunes windows
/// every 10 s. [`RateLimiter::dispose`] cancels it.
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(limits: Vec<ProviderLimit>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(LimiterInner {
            limits: limits
                .into_iter()
                .map(|l| (l.provider.clone(), l))
                .collect(),
            windows: Mutex::new(HashMap::new()),
            events,
            epoch: Instant::now(),
        });

        let sweeper = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sweeper.sweep();
            }
        });

        Self {
            inner,
            sweep: Mutex::new(Some(handle)),
        }
    }

    /// Subscribe to warning/exceeded events.
    pub fn subscribe(&self) -> broadcast::Receiver<RateLimitEvent> {
        self.inner.events.subscribe()
    }

    /// Record `count` requests for `provider` in the current second bucket.
    ///
    /// The count parameter is unsigned, so the clamp-to-zero the rolling
    /// window requires holds structurally.
    pub fn track(&self, provider: &str, count: u32) {
        let bucket = self.inner.epoch.elapsed().as_secs();
        let event = {
            let mut windows = self.inner.windows.lock();
            let window = windows.entry(provider.to_string()).or_default();
            match window.buckets.back_mut() {
                Some((last, existing)) if *last == bucket => *existing += count,
                _ => window.buckets.push_back((bucket, count)),
            }

            let current = self.inner.rpm_locked(&mut windows, provider);
            self.check_thresholds(&mut windows, provider, current)
        };

        if let Some(event) = event {
            if let RateLimitEvent::Exceeded { current_rpm, limit, .. } = &event {
                warn!(provider = %provider, current_rpm, limit, "Rate limit exceeded");
            }
            let _ = self.inner.events.send(event);
        }
    }

    fn check_thresholds(
        &self,
        windows: &mut HashMap<String, ProviderWindow>,
        provider: &str,
        current: u32,
    ) -> Option<RateLimitEvent> {
        let limit = self.inner.limits.get(provider)?;
        let window = windows.get_mut(provider)?;

        if current >= limit.requests_per_minute {
            return Some(RateLimitEvent::Exceeded {
                provider: provider.to_string(),
                current_rpm: current,
                limit: limit.requests_per_minute,
            });
        }

        if current >= limit.threshold() {
            if window.warned {
                return None;
            }
            window.warned = true;
            return Some(RateLimitEvent::Warning {
                provider: provider.to_string(),
                current_rpm: current,
                limit: limit.requests_per_minute,
                headroom: limit.requests_per_minute - current,
            });
        }

        window.warned = false;
        None
    }

    /// Requests seen for `provider` in the trailing 60 s.
    pub fn current_rpm(&self, provider: &str) -> u32 {
        let mut windows = self.inner.windows.lock();
        self.inner.rpm_locked(&mut windows, provider)
    }

    /// Remaining requests before the provider's limit. `None` means the
    /// provider is unconfigured and therefore unlimited.
    pub fn headroom(&self, provider: &str) -> Option<u32> {
        let limit = self.inner.limits.get(provider)?;
        let current = self.current_rpm(provider);
        Some(limit.requests_per_minute.saturating_sub(current))
    }

    /// Empty the provider's window and clear its warned flag.
    pub fn reset(&self, provider: &str) {
        if let Some(window) = self.inner.windows.lock().get_mut(provider) {
            window.buckets.clear();
            window.warned = false;
        }
    }

    pub fn reset_all(&self) {
        let mut windows = self.inner.windows.lock();
        for window in windows.values_mut() {
            window.buckets.clear();
            window.warned = false;
        }
    }

    /// Cancel the sweep task. Subsequent tracks still account but nothing
    /// prunes in the background.
    pub fn dispose(&self) {
        if let Some(handle) = self.sweep.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.dispose();
    }
}
