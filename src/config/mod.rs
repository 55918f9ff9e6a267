//! Configuration for the execution core.
//!
//! Every section carries the documented defaults, deserializes with
//! `#[serde(default)]`, and is checked as a whole by
//! [`SwarmConfig::validate`] so a bad file reports all violations at once.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{Result, SwarmError};
use crate::ratelimit::ProviderLimit;
use crate::strategy::StrategyKind;

pub const MIN_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub scheduler: SchedulerConfig,
    pub pool: WorkerPoolConfig,
    pub channel: ChannelConfig,
    pub rate_limit: RateLimitConfig,
    pub workspace: WorkspaceConfig,
}

impl SwarmConfig {
    pub async fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.toml");
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = dir.join("config.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| SwarmError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate all sections, collecting every violation.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.pool.max_workers) {
            errors.push(format!(
                "pool.max_workers must be in [{}, {}], got {}",
                MIN_WORKERS, MAX_WORKERS, self.pool.max_workers
            ));
        }
        if self.pool.spawn_timeout_ms == 0 {
            errors.push("pool.spawn_timeout_ms must be greater than 0".to_string());
        }

        if self.channel.max_queue_size == 0 {
            errors.push("channel.max_queue_size must be greater than 0".to_string());
        }
        if self.channel.message_timeout_ms == 0 {
            errors.push("channel.message_timeout_ms must be greater than 0".to_string());
        }
        if self.channel.max_reconnect_attempts == 0 {
            errors.push("channel.max_reconnect_attempts must be greater than 0".to_string());
        }

        if self.scheduler.max_rpm == 0 {
            errors.push("scheduler.max_rpm must be greater than 0".to_string());
        }

        for limit in &self.rate_limit.providers {
            if limit.provider.is_empty() {
                errors.push("rate_limit provider name must not be empty".to_string());
            }
            if limit.requests_per_minute == 0 {
                errors.push(format!(
                    "rate_limit.{} requests_per_minute must be greater than 0",
                    limit.provider
                ));
            }
            if let Some(threshold) = limit.warning_threshold {
                if threshold > limit.requests_per_minute {
                    errors.push(format!(
                        "rate_limit.{} warning_threshold {} exceeds limit {}",
                        limit.provider, threshold, limit.requests_per_minute
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SwarmError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub strategy: StrategyKind,
    pub max_rpm: u32,
    pub estimated_rpm_per_task: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::MaxParallel,
            max_rpm: 3800,
            estimated_rpm_per_task: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    pub spawn_timeout_ms: u64,
    pub auto_cleanup: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            spawn_timeout_ms: 3000,
            auto_cleanup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// 0 binds a dynamic loopback port.
    pub port: u16,
    pub max_queue_size: usize,
    pub message_timeout_ms: u64,
    pub enable_remote_fallback: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            port: 0,
            max_queue_size: 1000,
            message_timeout_ms: 5000,
            enable_remote_fallback: true,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub providers: Vec<ProviderLimit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub strict_mode: bool,
    pub allow_nested_dirs: bool,
    pub support_wildcards: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            strict_mode: true,
            allow_nested_dirs: false,
            support_wildcards: true,
        }
    }
}
