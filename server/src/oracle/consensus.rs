//! Agreement test across independent readings of the same metric.
//!
//! Deviation is measured from the arithmetic mean of all included readings,
//! not a robust estimator. Outliers are only dropped when the policy asks for
//! it and enough sources still agree.

use serde::Serialize;

use super::confidence::{ConfidenceScorer, Dispersion, ScoredPoint};
use super::signature::majority;
use crate::config::ConsensusPolicy;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusOutcome {
    pub aggregate_value: f64,
    pub consensus_reached: bool,
    pub confidence: f64,
    pub included_sources: Vec<String>,
    pub deviating_sources: Vec<String>,
    pub dispersion: Dispersion,
}

impl ConsensusOutcome {
    fn empty() -> Self {
        Self {
            aggregate_value: 0.0,
            consensus_reached: false,
            confidence: 0.0,
            included_sources: Vec::new(),
            deviating_sources: Vec::new(),
            dispersion: Dispersion::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    policy: ConsensusPolicy,
    scorer: ConfidenceScorer,
}

impl ConsensusEngine {
    pub fn new(policy: ConsensusPolicy, scorer: ConfidenceScorer) -> Self {
        Self { policy, scorer }
    }

    pub fn policy(&self) -> &ConsensusPolicy {
        &self.policy
    }

    pub fn evaluate(&self, points: &[ScoredPoint]) -> ConsensusOutcome {
        if points.is_empty() {
            return ConsensusOutcome::empty();
        }

        let required = self
            .policy
            .required_consensus
            .unwrap_or_else(|| majority(points.len()))
            .max(1);

        let mut kept: Vec<&ScoredPoint> = points.iter().collect();
        let mut dropped: Vec<&ScoredPoint> = Vec::new();

        let (mean, deviating) = loop {
            let mean = mean_of(&kept);
            let deviating: Vec<&ScoredPoint> = kept
                .iter()
                .copied()
                .filter(|p| !self.within_tolerance(p.value, mean))
                .collect();

            if deviating.is_empty() || !self.policy.drop_outliers || kept.len() <= required {
                break (mean, deviating);
            }

            // Drop the single worst reading and re-test against the new mean.
            let worst = kept
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    relative_deviation(a.value, mean).total_cmp(&relative_deviation(b.value, mean))
                })
                .map(|(i, _)| i)
                .unwrap_or(0);
            dropped.push(kept.remove(worst));
        };

        let agreeing: Vec<&ScoredPoint> = kept
            .iter()
            .copied()
            .filter(|p| self.within_tolerance(p.value, mean))
            .collect();
        let scored: Vec<ScoredPoint> = kept.iter().map(|p| (*p).clone()).collect();
        let aggregate = self.scorer.aggregate(&scored);

        let mut deviating_sources = source_ids(&dropped);
        deviating_sources.extend(source_ids(&deviating));

        ConsensusOutcome {
            aggregate_value: mean,
            consensus_reached: deviating.is_empty() && agreeing.len() >= required,
            confidence: aggregate.score,
            included_sources: source_ids(&agreeing),
            deviating_sources,
            dispersion: aggregate.dispersion,
        }
    }

    fn within_tolerance(&self, value: f64, mean: f64) -> bool {
        relative_deviation(value, mean) <= self.policy.variance_tolerance
    }
}

/// |v - mean| / |mean|; the absolute deviation when the mean is zero.
pub fn relative_deviation(value: f64, mean: f64) -> f64 {
    let diff = (value - mean).abs();
    if mean == 0.0 {
        diff
    } else {
        diff / mean.abs()
    }
}

fn mean_of(points: &[&ScoredPoint]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    points.iter().map(|p| p.value).sum::<f64>() / points.len() as f64
}

fn source_ids(points: &[&ScoredPoint]) -> Vec<String> {
    points.iter().map(|p| p.source_id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfidencePolicy;
    use proptest::prelude::*;

    fn engine(policy: ConsensusPolicy) -> ConsensusEngine {
        ConsensusEngine::new(policy, ConfidenceScorer::new(ConfidencePolicy::default()))
    }

    fn points(values: &[f64]) -> Vec<ScoredPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| ScoredPoint {
                source_id: format!("source-{}", i),
                value: *v,
                score: 0.9,
                reliability: 1.0,
                age_secs: 0,
            })
            .collect()
    }

    #[test]
    fn agreeing_sources_reach_consensus() {
        let outcome = engine(ConsensusPolicy::default()).evaluate(&points(&[100.0, 101.0, 99.0]));
        assert!(outcome.consensus_reached);
        assert!((outcome.aggregate_value - 100.0).abs() < 1e-9);
        assert!(outcome.confidence >= 0.8);
        assert!(outcome.deviating_sources.is_empty());
    }

    #[test]
    fn outlier_blocks_consensus() {
        let outcome = engine(ConsensusPolicy::default()).evaluate(&points(&[100.0, 140.0, 95.0]));
        assert!(!outcome.consensus_reached);
        assert!(outcome.deviating_sources.contains(&"source-1".to_string()));
    }

    #[test]
    fn outliers_dropped_only_when_configured() {
        let policy = ConsensusPolicy {
            drop_outliers: true,
            ..ConsensusPolicy::default()
        };
        let outcome = engine(policy).evaluate(&points(&[100.0, 101.0, 99.0, 100.5, 160.0]));
        assert!(outcome.consensus_reached);
        assert_eq!(outcome.deviating_sources, vec!["source-4".to_string()]);
        assert_eq!(outcome.included_sources.len(), 4);
        assert!((outcome.aggregate_value - 100.125).abs() < 1e-9);
    }

    #[test]
    fn deviation_is_measured_from_the_mean_of_all_points() {
        // 106 is 6% above the other two but under 4% from the overall mean of 102.
        let outcome = engine(ConsensusPolicy::default()).evaluate(&points(&[100.0, 100.0, 106.0]));
        assert!(outcome.consensus_reached);
        assert!(outcome.deviating_sources.is_empty());

        let outcome = engine(ConsensusPolicy::default()).evaluate(&points(&[100.0, 100.0, 111.0]));
        assert!(!outcome.consensus_reached);
        assert_eq!(outcome.deviating_sources, vec!["source-2".to_string()]);
    }

    #[test]
    fn dropping_needs_enough_agreeing_sources() {
        let policy = ConsensusPolicy {
            drop_outliers: true,
            required_consensus: Some(3),
            ..ConsensusPolicy::default()
        };
        let outcome = engine(policy).evaluate(&points(&[100.0, 100.0, 200.0]));
        assert!(!outcome.consensus_reached);
    }

    #[test]
    fn single_point_agrees_with_itself() {
        let outcome = engine(ConsensusPolicy::default()).evaluate(&points(&[42.0]));
        assert!(outcome.consensus_reached);
        assert_eq!(outcome.aggregate_value, 42.0);
    }

    #[test]
    fn no_points_never_reach_consensus() {
        let outcome = engine(ConsensusPolicy::default()).evaluate(&[]);
        assert!(!outcome.consensus_reached);
        assert_eq!(outcome.confidence, 0.0);
    }

    #[test]
    fn zero_mean_uses_absolute_deviation() {
        let outcome = engine(ConsensusPolicy::default()).evaluate(&points(&[0.0, 0.0]));
        assert!(outcome.consensus_reached);
        let outcome = engine(ConsensusPolicy::default()).evaluate(&points(&[-1.0, 1.0]));
        assert!(!outcome.consensus_reached);
    }

    proptest! {
        #[test]
        fn values_within_tolerance_agree(
            base in 1.0f64..1.0e6,
            offsets in prop::collection::vec(-0.02f64..0.02, 1..8),
        ) {
            let values: Vec<f64> = offsets.iter().map(|o| base * (1.0 + o)).collect();
            let outcome = engine(ConsensusPolicy::default()).evaluate(&points(&values));
            prop_assert!(outcome.consensus_reached);
            prop_assert!((0.0..=1.0).contains(&outcome.confidence));
        }

        #[test]
        fn one_far_point_breaks_agreement(
            base in 1.0f64..1.0e6,
            n in 2usize..8,
            factor in 1.2f64..3.0,
        ) {
            let mut values = vec![base; n];
            values.push(base * factor);
            let outcome = engine(ConsensusPolicy::default()).evaluate(&points(&values));
            prop_assert!(!outcome.consensus_reached);
        }
    }
}
