//! Oracle data validation and aggregation
//!
//! Every reading passes the same gate before it may influence a decision:
//! the source must be registered on the feed, the timestamp must be fresh, the
//! signature must verify, and the claimed confidence must reach the feed's floor.

pub mod confidence;
pub mod consensus;
pub mod poller;
pub mod signature;
pub mod timestamp;

use crate::config::{ConfidencePolicy, SignaturePolicy, TimestampPolicy};
use crate::error::EngineError;
use crate::models::{OracleDataPoint, OracleFeed};

use confidence::{ConfidenceScorer, ScoredPoint};
use signature::SignatureVerifier;
use timestamp::{TimestampRejection, TimestampValidator};

#[derive(Debug, Clone)]
pub struct PointFilter {
    signatures: SignaturePolicy,
    timestamps: TimestampValidator,
    scorer: ConfidenceScorer,
}

impl PointFilter {
    pub fn new(
        signatures: SignaturePolicy,
        timestamps: TimestampPolicy,
        confidence: ConfidencePolicy,
    ) -> Self {
        Self {
            signatures,
            timestamps: TimestampValidator::new(timestamps),
            scorer: ConfidenceScorer::new(confidence),
        }
    }

    pub fn scorer(&self) -> &ConfidenceScorer {
        &self.scorer
    }

    /// Check a stored or incoming reading at `now` and score it.
    pub fn check(
        &self,
        feed: &OracleFeed,
        point: &OracleDataPoint,
        reliability: f64,
        now: i64,
    ) -> Result<ScoredPoint, EngineError> {
        let age_secs = self.check_authenticity(
            feed,
            &point.source_id,
            point.timestamp,
            point.value,
            point.signature.as_deref(),
            now,
        )?;

        if point.confidence < feed.min_confidence {
            return Err(EngineError::BelowConfidenceThreshold {
                actual: point.confidence,
                required: feed.min_confidence,
            });
        }

        Ok(ScoredPoint {
            source_id: point.source_id.clone(),
            value: point.value,
            score: self.scorer.score_point(
                point.confidence,
                age_secs,
                feed.max_staleness_secs,
                reliability,
            ),
            reliability,
            age_secs,
        })
    }

    /// Source, freshness and signature checks, in that order. Returns the age in seconds.
    pub fn check_authenticity(
        &self,
        feed: &OracleFeed,
        source_id: &str,
        timestamp: i64,
        value: f64,
        signature: Option<&str>,
        now: i64,
    ) -> Result<i64, EngineError> {
        let source = feed.source(source_id).ok_or_else(|| {
            EngineError::Unauthorized(format!(
                "source {} is not registered on feed {}",
                source_id, feed.id
            ))
        })?;

        let check = self
            .timestamps
            .validate(timestamp, now, feed.max_staleness_secs);
        match check.reason {
            Some(TimestampRejection::Stale) => {
                return Err(EngineError::StaleData {
                    source_id: source_id.to_string(),
                    age_secs: check.age_secs,
                    max_staleness_secs: feed.max_staleness_secs,
                })
            }
            Some(TimestampRejection::FutureDated) => {
                return Err(EngineError::FutureData {
                    source_id: source_id.to_string(),
                    ahead_secs: -check.age_secs,
                })
            }
            None => {}
        }

        if self.signatures.require_signatures || signature.is_some() {
            let payload = SignatureVerifier::signing_payload(source_id, timestamp, value);
            let verdict = SignatureVerifier::verify(&payload, signature, &source.public_key);
            if let Some(reason) = verdict.reason {
                return Err(EngineError::InvalidSignature {
                    source_id: source_id.to_string(),
                    reason,
                });
            }
        }

        Ok(check.age_secs)
    }
}
