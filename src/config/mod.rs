//! Configuration for the operator.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the operator process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Fixed delay before retrying a `Requeue`-kind failure.
    pub requeue_after_secs: u64,
    /// Resync period for a healthy cluster.
    pub healthy_requeue_secs: u64,
    /// Poll interval for infrastructure waits.
    pub wait_tick_secs: u64,
    /// Infrastructure wait budget per replica; the total is this times `replicas + 2`.
    pub wait_timeout_per_replica_secs: u64,
    /// How long a pod may sit in Terminating before it is force-deleted.
    pub heal_allowance_secs: u64,
    /// Pause between the membership-join request and the re-check.
    pub join_settle_millis: u64,
    /// Backoff for infrastructure and protocol failures.
    pub backoff: BackoffConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            requeue_after_secs: 10,
            healthy_requeue_secs: 60,
            wait_tick_secs: 5,
            wait_timeout_per_replica_secs: 30,
            heal_allowance_secs: 300,
            join_settle_millis: 1000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.wait_tick_secs == 0 {
            return Err(Error::InvalidConfig("waitTickSecs must be non-zero".to_string()));
        }
        if self.wait_timeout_per_replica_secs < self.wait_tick_secs {
            return Err(Error::InvalidConfig(
                "waitTimeoutPerReplicaSecs must be at least waitTickSecs".to_string(),
            ));
        }
        if self.requeue_after_secs == 0 {
            return Err(Error::InvalidConfig("requeueAfterSecs must be non-zero".to_string()));
        }
        if self.join_settle_millis > 5_000 {
            return Err(Error::InvalidConfig(
                "joinSettleMillis must not exceed 5000".to_string(),
            ));
        }
        self.backoff.validate()
    }

    pub fn requeue_after(&self) -> Duration {
        Duration::from_secs(self.requeue_after_secs)
    }

    pub fn healthy_requeue(&self) -> Duration {
        Duration::from_secs(self.healthy_requeue_secs)
    }

    pub fn wait_tick(&self) -> Duration {
        Duration::from_secs(self.wait_tick_secs)
    }

    /// Total budget for an infrastructure wait on a cluster with `replicas` replicas per master.
    pub fn wait_timeout(&self, replicas: i32) -> Duration {
        let factor = (replicas.max(0) as u64) + 2;
        Duration::from_secs(self.wait_timeout_per_replica_secs * factor)
    }

    pub fn heal_allowance(&self) -> Duration {
        Duration::from_secs(self.heal_allowance_secs)
    }

    pub fn join_settle(&self) -> Duration {
        Duration::from_millis(self.join_settle_millis)
    }
}

/// Exponential backoff applied to `Backoff`-disposition failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay_millis: u64,
    /// Upper bound on the delay.
    pub max_delay_secs: u64,
    /// Multiplier applied per consecutive failure.
    pub multiplier: f64,
    /// Add up to 25% jitter.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_millis: 500,
            max_delay_secs: 300,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(Error::InvalidConfig("backoff.multiplier must be >= 1.0".to_string()));
        }
        if self.initial_delay_millis == 0 {
            return Err(Error::InvalidConfig(
                "backoff.initialDelayMillis must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = (self.initial_delay_millis as f64 / 1000.0) * self.multiplier.powi(exponent);
        let delay = Duration::from_secs_f64(base.min(self.max_delay_secs as f64));

        if self.jitter {
            let jitter_factor = 1.0 + rand::random::<f64>() * 0.25;
            Duration::from_secs_f64(delay.as_secs_f64() * jitter_factor)
        } else {
            delay
        }
    }
}
