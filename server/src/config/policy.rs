//! Policy objects handed to each engine component

use serde::{Deserialize, Serialize};

use crate::models::ReleaseCondition;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignaturePolicy {
    /// Reject unsigned data points outright
    pub require_signatures: bool,
}

impl Default for SignaturePolicy {
    fn default() -> Self {
        Self {
            require_signatures: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimestampPolicy {
    pub clock_skew_tolerance_secs: i64,
}

impl Default for TimestampPolicy {
    fn default() -> Self {
        Self {
            clock_skew_tolerance_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfidencePolicy {
    /// Share of the claimed confidence lost at `max_staleness`
    pub decay_weight: f64,
    /// Multiplier applied to the coefficient of variation
    pub variance_penalty_factor: f64,
    pub max_variance_penalty: f64,
    /// EMA step for source reliability updates
    pub reliability_alpha: f64,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            decay_weight: 0.5,
            variance_penalty_factor: 2.0,
            max_variance_penalty: 0.5,
            reliability_alpha: 0.1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusPolicy {
    /// Maximum relative deviation from the mean, 0.05 = 5%
    pub variance_tolerance: f64,
    /// Agreeing sources needed; `None` means ceil(N/2)
    pub required_consensus: Option<usize>,
    pub drop_outliers: bool,
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        Self {
            variance_tolerance: 0.05,
            required_consensus: None,
            drop_outliers: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerificationPolicy {
    pub min_confidence: f64,
    pub min_justification_len: usize,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            min_confidence: 0.8,
            min_justification_len: 20,
        }
    }
}

/// Ledger interaction limits shared by every release
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerPolicy {
    pub rpc_url: Option<String>,
    pub request_timeout_ms: u64,
    pub confirmation_poll_interval_ms: u64,
    pub confirmation_max_polls: u32,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            rpc_url: None,
            request_timeout_ms: 10_000,
            confirmation_poll_interval_ms: 1_000,
            confirmation_max_polls: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollerConfig {
    pub enabled: bool,
    pub tick_secs: u64,
    pub request_timeout_secs: u64,
    pub max_backoff_secs: u64,
    pub max_concurrent_feeds: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: 5,
            request_timeout_secs: 10,
            max_backoff_secs: 300,
            max_concurrent_feeds: 8,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditConfig {
    pub retention_days: i64,
    /// Six-field cron expression for the pruning job
    pub prune_schedule: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: 365,
            prune_schedule: "0 0 3 * * *".to_string(),
        }
    }
}

/// Defaults applied to allocations created without an explicit condition
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReleaseDefaults {
    pub condition: ReleaseCondition,
}
