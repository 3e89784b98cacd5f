//! Master configuration.
//!
//! Every knob is an explicit field with a documented default, validated at
//! construction rather than at point of use.

use overseer_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one master process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Bound on a single claim attempt. A timed-out claim is treated as a
    /// failed claim, never a success. Default 5000.
    pub claim_timeout_ms: u64,
    /// Attempts for a pending-request read before the evaluation pass is
    /// abandoned. Default 3.
    pub store_retry_attempts: u32,
    /// First backoff delay between store retries; doubles per attempt.
    /// Default 1000.
    pub store_retry_base_ms: u64,
    /// Dispatch failures tolerated for one request before it is completed
    /// with a worker-unavailable result instead of retried. Default 3.
    pub dispatch_retry_limit: u32,
    /// Interval of the safety-net sweep that re-evaluates every builder
    /// and reclaims orphaned requests. Default 60.
    pub sweep_interval_secs: u64,
    /// A master with no heartbeat for this long is presumed dead and its
    /// claims become reclaimable. Default 600.
    pub master_stale_after_secs: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            claim_timeout_ms: 5_000,
            store_retry_attempts: 3,
            store_retry_base_ms: 1_000,
            dispatch_retry_limit: 3,
            sweep_interval_secs: 60,
            master_stale_after_secs: 600,
        }
    }
}

impl MasterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.claim_timeout_ms == 0 {
            return Err(Error::InvalidInput("claim_timeout_ms must be > 0".into()));
        }
        if self.store_retry_attempts == 0 {
            return Err(Error::InvalidInput(
                "store_retry_attempts must be > 0".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::InvalidInput("sweep_interval_secs must be > 0".into()));
        }
        if self.master_stale_after_secs <= self.sweep_interval_secs {
            return Err(Error::InvalidInput(
                "master_stale_after_secs must exceed sweep_interval_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    /// Backoff before retry number `attempt` (zero-based). Doubles per
    /// attempt, saturating instead of overflowing for large counts.
    pub fn store_retry_backoff(&self, attempt: u32) -> Duration {
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.store_retry_base_ms.saturating_mul(multiplier))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn master_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.master_stale_after_secs as i64)
    }
}
