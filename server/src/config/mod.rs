//! Engine configuration, read once from the environment at startup

mod policy;

use std::env;
use std::str::FromStr;

pub use policy::{
    AuditConfig, ConfidencePolicy, ConsensusPolicy, LedgerPolicy, PollerConfig,
    ReleaseDefaults, SignaturePolicy, TimestampPolicy, VerificationPolicy,
};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            cors_allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub database_url: Option<String>,
    pub signature: SignaturePolicy,
    pub timestamp: TimestampPolicy,
    pub confidence: ConfidencePolicy,
    pub consensus: ConsensusPolicy,
    pub verification: VerificationPolicy,
    pub release: ReleaseDefaults,
    pub ledger: LedgerPolicy,
    pub poller: PollerConfig,
    pub audit: AuditConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let release = defaults.release.condition.clone();

        Self {
            server: ServerConfig {
                port: env_or("PORT", defaults.server.port),
                cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                    .map(|origins| {
                        origins
                            .split(',')
                            .map(|origin| origin.trim().to_string())
                            .filter(|origin| !origin.is_empty())
                            .collect()
                    })
                    .unwrap_or(defaults.server.cors_allowed_origins),
            },
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty()),
            signature: SignaturePolicy {
                require_signatures: env_or(
                    "REQUIRE_SIGNATURES",
                    defaults.signature.require_signatures,
                ),
            },
            timestamp: TimestampPolicy {
                clock_skew_tolerance_secs: env_or(
                    "CLOCK_SKEW_TOLERANCE_SECONDS",
                    defaults.timestamp.clock_skew_tolerance_secs,
                ),
            },
            confidence: ConfidencePolicy {
                decay_weight: env_or("CONFIDENCE_DECAY_WEIGHT", defaults.confidence.decay_weight),
                variance_penalty_factor: env_or(
                    "CONFIDENCE_VARIANCE_PENALTY_FACTOR",
                    defaults.confidence.variance_penalty_factor,
                ),
                max_variance_penalty: env_or(
                    "CONFIDENCE_MAX_VARIANCE_PENALTY",
                    defaults.confidence.max_variance_penalty,
                ),
                reliability_alpha: env_or(
                    "SOURCE_RELIABILITY_ALPHA",
                    defaults.confidence.reliability_alpha,
                ),
            },
            consensus: ConsensusPolicy {
                variance_tolerance: env_or(
                    "CONSENSUS_VARIANCE_TOLERANCE",
                    defaults.consensus.variance_tolerance,
                ),
                required_consensus: env::var("CONSENSUS_REQUIRED_SOURCES")
                    .ok()
                    .and_then(|v| v.parse().ok()),
                drop_outliers: env_or("CONSENSUS_DROP_OUTLIERS", defaults.consensus.drop_outliers),
            },
            verification: VerificationPolicy {
                min_confidence: env_or("MIN_CONFIDENCE", defaults.verification.min_confidence),
                min_justification_len: env_or(
                    "MIN_OVERRIDE_JUSTIFICATION_LENGTH",
                    defaults.verification.min_justification_len,
                ),
            },
            release: ReleaseDefaults {
                condition: crate::models::ReleaseCondition {
                    min_confidence: env_or("RELEASE_MIN_CONFIDENCE", release.min_confidence),
                    require_milestone_completion: true,
                    auto_release: env_or("RELEASE_AUTO", release.auto_release),
                    high_value_threshold: env_or(
                        "RELEASE_HIGH_VALUE_THRESHOLD",
                        release.high_value_threshold,
                    ),
                    approval_threshold: env_or(
                        "RELEASE_APPROVAL_THRESHOLD",
                        release.approval_threshold,
                    ),
                    max_retries: env_or("RELEASE_MAX_RETRIES", release.max_retries),
                    backoff_base_ms: env_or("RELEASE_BACKOFF_BASE_MS", release.backoff_base_ms),
                    backoff_max_ms: env_or("RELEASE_BACKOFF_MAX_MS", release.backoff_max_ms),
                },
            },
            ledger: LedgerPolicy {
                rpc_url: env::var("LEDGER_RPC_URL").ok().filter(|url| !url.trim().is_empty()),
                request_timeout_ms: env_or(
                    "LEDGER_REQUEST_TIMEOUT_MS",
                    defaults.ledger.request_timeout_ms,
                ),
                confirmation_poll_interval_ms: env_or(
                    "LEDGER_CONFIRMATION_POLL_MS",
                    defaults.ledger.confirmation_poll_interval_ms,
                ),
                confirmation_max_polls: env_or(
                    "LEDGER_CONFIRMATION_MAX_POLLS",
                    defaults.ledger.confirmation_max_polls,
                ),
            },
            poller: PollerConfig {
                enabled: env_or("FEED_POLLER_ENABLED", defaults.poller.enabled),
                tick_secs: env_or("FEED_POLLER_TICK_SECONDS", defaults.poller.tick_secs),
                request_timeout_secs: env_or(
                    "FEED_POLLER_TIMEOUT_SECONDS",
                    defaults.poller.request_timeout_secs,
                ),
                max_backoff_secs: env_or(
                    "FEED_POLLER_MAX_BACKOFF_SECONDS",
                    defaults.poller.max_backoff_secs,
                ),
                max_concurrent_feeds: env_or(
                    "FEED_POLLER_CONCURRENCY",
                    defaults.poller.max_concurrent_feeds,
                ),
            },
            audit: AuditConfig {
                retention_days: env_or("AUDIT_RETENTION_DAYS", defaults.audit.retention_days),
                prune_schedule: env::var("AUDIT_PRUNE_SCHEDULE")
                    .unwrap_or(defaults.audit.prune_schedule),
            },
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset or malformed.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable configuration value");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_garbage() {
        env::set_var("EMPOWERGRID_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or("EMPOWERGRID_TEST_GARBAGE", 7u32), 7);
        env::set_var("EMPOWERGRID_TEST_NUMBER", " 42 ");
        assert_eq!(env_or("EMPOWERGRID_TEST_NUMBER", 7u32), 42);
        assert_eq!(env_or("EMPOWERGRID_TEST_UNSET", 0.8f64), 0.8);
    }

    #[test]
    fn defaults_match_documented_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.consensus.variance_tolerance, 0.05);
        assert_eq!(config.verification.min_confidence, 0.8);
        assert_eq!(config.timestamp.clock_skew_tolerance_secs, 60);
        assert!(config.release.condition.require_milestone_completion);
    }
}
