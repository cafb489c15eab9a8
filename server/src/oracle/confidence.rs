//! Confidence scoring for single readings and for windows of readings.

use chrono::Utc;
use serde::Serialize;

use crate::config::ConfidencePolicy;
use crate::models::SourceReliability;

const EPSILON: f64 = 1e-12;

/// A reading that survived signature and staleness checks, with its score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredPoint {
    pub source_id: String,
    pub value: f64,
    pub score: f64,
    pub reliability: f64,
    pub age_secs: i64,
}

/// Spread of a set of values (population statistics)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Dispersion {
    pub mean: f64,
    pub variance: f64,
    pub std_dev: f64,
    pub coefficient_of_variation: f64,
    pub spread: f64,
}

impl Dispersion {
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        let coefficient_of_variation = if mean.abs() > EPSILON {
            std_dev / mean.abs()
        } else if std_dev > EPSILON {
            f64::INFINITY
        } else {
            0.0
        };
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });

        Self {
            mean,
            variance,
            std_dev,
            coefficient_of_variation,
            spread: max - min,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregateConfidence {
    /// Final score in [0,1]
    pub score: f64,
    pub weighted_mean_score: f64,
    pub variance_penalty: f64,
    pub dispersion: Dispersion,
}

impl AggregateConfidence {
    pub fn empty() -> Self {
        Self {
            score: 0.0,
            weighted_mean_score: 0.0,
            variance_penalty: 0.0,
            dispersion: Dispersion::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    policy: ConfidencePolicy,
}

impl ConfidenceScorer {
    pub fn new(policy: ConfidencePolicy) -> Self {
        Self { policy }
    }

    /// Claimed confidence discounted linearly by age and by the source's track record.
    pub fn score_point(
        &self,
        claimed: f64,
        age_secs: i64,
        max_staleness_secs: i64,
        reliability: f64,
    ) -> f64 {
        let age_ratio = if max_staleness_secs > 0 {
            (age_secs.max(0) as f64 / max_staleness_secs as f64).min(1.0)
        } else {
            1.0
        };
        let freshness = 1.0 - self.policy.decay_weight.clamp(0.0, 1.0) * age_ratio;

        clamp_unit(claimed) * freshness * clamp_unit(reliability)
    }

    /// Reliability-weighted mean score, penalised by disagreement between values.
    pub fn aggregate(&self, points: &[ScoredPoint]) -> AggregateConfidence {
        if points.is_empty() {
            return AggregateConfidence::empty();
        }

        let total_weight: f64 = points.iter().map(|p| clamp_unit(p.reliability)).sum();
        let weighted_mean_score = if total_weight > EPSILON {
            points
                .iter()
                .map(|p| clamp_unit(p.score) * clamp_unit(p.reliability))
                .sum::<f64>()
                / total_weight
        } else {
            0.0
        };

        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        let dispersion = Dispersion::of(&values);
        let variance_penalty = (dispersion.coefficient_of_variation
            * self.policy.variance_penalty_factor)
            .min(self.policy.max_variance_penalty)
            .clamp(0.0, 1.0);

        AggregateConfidence {
            score: clamp_unit(weighted_mean_score * (1.0 - variance_penalty)),
            weighted_mean_score,
            variance_penalty,
            dispersion,
        }
    }

    /// Exponential moving average: agreeing sources observe 1.0, deviating ones 0.0.
    pub fn next_reliability(&self, current: &SourceReliability, agreed: bool) -> SourceReliability {
        let alpha = self.policy.reliability_alpha.clamp(0.0, 1.0);
        let observation = if agreed { 1.0 } else { 0.0 };

        SourceReliability {
            source_id: current.source_id.clone(),
            weight: clamp_unit((1.0 - alpha) * current.weight + alpha * observation),
            observations: current.observations + 1,
            updated_at: Utc::now(),
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
