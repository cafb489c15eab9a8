//! Milestone verification: evaluate feed data against targets and record the decision

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::future::try_join_all;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::auth::Actor;
use crate::config::VerificationPolicy;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    confidence_pct, AttemptView, AuditEventKind, CreateMilestoneRequest, Evidence, MetricMeasurement,
    MetricTarget, Milestone, MilestoneVerificationAttempt, NewAuditEntry, OperationKind,
    OracleFeed, ReleaseState, SourceReliability, VerificationFailure, VerificationReceipt,
    VerificationStatus, VerificationStatusView,
};
use crate::oracle::confidence::ScoredPoint;
use crate::oracle::consensus::ConsensusEngine;
use crate::oracle::PointFilter;
use crate::services::audit_service::{elapsed_ms, rejection_kind, AuditLogger};
use crate::services::release_service::ReleaseService;
use crate::store::{AttemptClaim, EngineStore};

/// Tolerance for the inclusive confidence threshold
const THRESHOLD_EPSILON: f64 = 1e-9;

pub struct VerificationService {
    store: Arc<dyn EngineStore>,
    audit: Arc<AuditLogger>,
    filter: PointFilter,
    consensus: ConsensusEngine,
    policy: VerificationPolicy,
    releases: Option<Arc<ReleaseService>>,
}

impl VerificationService {
    pub fn new(
        store: Arc<dyn EngineStore>,
        audit: Arc<AuditLogger>,
        filter: PointFilter,
        consensus: ConsensusEngine,
        policy: VerificationPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            filter,
            consensus,
            policy,
            releases: None,
        }
    }

    /// Release allocations flagged `auto_release` once a milestone verifies.
    pub fn with_auto_release(mut self, releases: Arc<ReleaseService>) -> Self {
        self.releases = Some(releases);
        self
    }

    pub async fn register_milestone(&self, request: CreateMilestoneRequest) -> EngineResult<Milestone> {
        request.validate()?;
        for (i, target) in request.targets.iter().enumerate() {
            if !target.target_value.is_finite() || target.target_value < 0.0 {
                return Err(EngineError::Validation(format!(
                    "target {} must be a non-negative number",
                    target.feed_type
                )));
            }
            if request.targets[..i].iter().any(|t| t.feed_type == target.feed_type) {
                return Err(EngineError::Validation(format!(
                    "duplicate target for {}",
                    target.feed_type
                )));
            }
        }

        let milestone = Milestone {
            id: Uuid::new_v4(),
            project_id: request.project_id,
            index: request.index,
            title: request.title,
            targets: request.targets,
            due_date: request.due_date,
            current_attempt_id: None,
            verification_status: None,
            release_state: ReleaseState::Open,
            created_at: Utc::now(),
        };
        self.store.insert_milestone(&milestone).await?;
        info!(milestone_id = %milestone.id, project_id = %milestone.project_id, "milestone registered");
        Ok(milestone)
    }

    pub async fn submit_verification(
        &self,
        milestone_id: Uuid,
        evidence: Vec<Evidence>,
        actor: &Actor,
    ) -> EngineResult<VerificationReceipt> {
        let started = Instant::now();
        let milestone = match validate_evidence(&evidence) {
            Ok(()) => self.milestone(milestone_id).await,
            Err(err) => Err(err),
        };
        let milestone = match milestone {
            Ok(milestone) => milestone,
            Err(err) => {
                self.record_refusal(milestone_id, AuditEventKind::VerificationStarted, actor, &err)
                    .await?;
                return Err(err);
            }
        };
        let mut attempt = MilestoneVerificationAttempt::new(milestone_id, &actor.id, evidence);

        let claim = self.store.claim_attempt(&attempt).await?;
        if let Err(err) = claim_result(claim, milestone_id) {
            self.record_refusal(milestone_id, AuditEventKind::VerificationStarted, actor, &err)
                .await?;
            return Err(err);
        }
        self.audit
            .record(
                NewAuditEntry::new(
                    AuditEventKind::VerificationStarted,
                    actor.id.as_str(),
                    format!("attempt {} opened", attempt.id),
                )
                .milestone(milestone_id)
                .status(VerificationStatus::Pending.as_str()),
            )
            .await?;

        self.advance(&mut attempt, VerificationStatus::InProgress, actor, None)
            .await?;

        let measurements = match self.evaluate_targets(&milestone).await {
            Ok(measurements) => measurements,
            Err(err) => {
                // Leave no attempt stuck in progress.
                attempt.completed_at = Some(Utc::now());
                self.advance(&mut attempt, VerificationStatus::Failed, actor, Some(err.to_string().as_str()))
                    .await?;
                return Err(err);
            }
        };

        let confidence = measurements
            .iter()
            .map(|m| m.confidence)
            .fold(f64::INFINITY, f64::min);
        let confidence = if confidence.is_finite() { confidence } else { 0.0 };
        let failure = decide(&measurements, confidence, self.policy.min_confidence);

        attempt.confidence = confidence;
        attempt.measurements = measurements;
        attempt.failure_reason = failure;
        attempt.completed_at = Some(Utc::now());
        let next = if failure.is_some() {
            VerificationStatus::Failed
        } else {
            VerificationStatus::Verified
        };

        let detail = match failure {
            Some(reason) => format!(
                "confidence {} failed: {}",
                confidence_pct(confidence),
                reason.as_str()
            ),
            None => format!("confidence {} verified", confidence_pct(confidence)),
        };
        self.advance_timed(&mut attempt, next, actor, &detail, OperationKind::Verification, started)
            .await?;

        info!(
            %milestone_id,
            attempt_id = %attempt.id,
            status = attempt.status.as_str(),
            confidence = confidence_pct(confidence),
            "verification decided"
        );

        if attempt.status == VerificationStatus::Verified {
            if let Some(releases) = &self.releases {
                releases.spawn_auto_release(milestone_id);
            }
        }

        Ok(VerificationReceipt {
            attempt_id: attempt.id,
            status: attempt.status,
            confidence: confidence_pct(attempt.confidence),
            failure_reason: attempt.failure_reason,
            measurements: attempt.measurements,
        })
    }

    pub async fn get_verification_status(
        &self,
        milestone_id: Uuid,
    ) -> EngineResult<VerificationStatusView> {
        let milestone = self.milestone(milestone_id).await?;
        let attempts = self.store.list_attempts(milestone_id).await?;

        let current = milestone
            .current_attempt_id
            .and_then(|id| attempts.iter().find(|a| a.id == id));

        Ok(VerificationStatusView {
            milestone_id,
            status: current.map(|a| a.status),
            confidence: current.map_or(0, |a| confidence_pct(a.confidence)),
            current_attempt_id: milestone.current_attempt_id,
            release_state: milestone.release_state,
            overdue: milestone.is_overdue(Utc::now()),
            history: attempts.iter().map(AttemptView::from).collect(),
        })
    }

    /// Force a milestone to MANUAL_OVERRIDE. Only Admin or Governance actors may do this.
    ///
    /// Every refusal is written to the milestone's audit trail before it is returned.
    pub async fn override_verification(
        &self,
        milestone_id: Uuid,
        justification: &str,
        evidence: Vec<Evidence>,
        actor: &Actor,
    ) -> EngineResult<VerificationReceipt> {
        match self
            .apply_override(milestone_id, justification, evidence, actor)
            .await
        {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                self.record_refusal(milestone_id, AuditEventKind::VerificationTransition, actor, &err)
                    .await?;
                Err(err)
            }
        }
    }

    async fn apply_override(
        &self,
        milestone_id: Uuid,
        justification: &str,
        evidence: Vec<Evidence>,
        actor: &Actor,
    ) -> EngineResult<VerificationReceipt> {
        let started = Instant::now();

        if !actor.role.can_override() {
            return Err(EngineError::Unauthorized(format!(
                "{} may not override verification",
                actor.id
            )));
        }

        let justification = justification.trim();
        if justification.chars().count() < self.policy.min_justification_len {
            return Err(EngineError::Validation(format!(
                "justification must be at least {} characters",
                self.policy.min_justification_len
            )));
        }
        validate_evidence(&evidence)?;

        let milestone = self.milestone(milestone_id).await?;
        if milestone.release_state == ReleaseState::Confirmed {
            return Err(EngineError::AlreadyReleased { milestone_id });
        }
        if milestone.is_verified() {
            return Err(EngineError::AlreadyVerified { milestone_id });
        }

        let mut attempt = match self.open_attempt(&milestone).await? {
            Some(open) => open,
            None => {
                let fresh = MilestoneVerificationAttempt::new(milestone_id, &actor.id, Vec::new());
                match self.store.claim_attempt(&fresh).await? {
                    AttemptClaim::Claimed => fresh,
                    AttemptClaim::InProgress(id) => self.attempt(id).await?,
                    other => {
                        return Err(claim_result(other, milestone_id).err().unwrap_or(
                            EngineError::VerificationInProgress {
                                milestone_id,
                                attempt_id: fresh.id,
                            },
                        ))
                    }
                }
            }
        };

        attempt.evidence.extend(evidence);
        attempt.verified_by = actor.id.clone();
        attempt.justification = Some(justification.to_string());
        attempt.failure_reason = None;
        attempt.completed_at = Some(Utc::now());

        let detail = format!("manual override: {}", justification);
        self.advance_timed(
            &mut attempt,
            VerificationStatus::ManualOverride,
            actor,
            &detail,
            OperationKind::Override,
            started,
        )
        .await?;

        warn!(%milestone_id, attempt_id = %attempt.id, actor = %actor.id, "verification overridden");

        Ok(VerificationReceipt {
            attempt_id: attempt.id,
            status: attempt.status,
            confidence: confidence_pct(attempt.confidence),
            failure_reason: None,
            measurements: attempt.measurements,
        })
    }

    async fn milestone(&self, milestone_id: Uuid) -> EngineResult<Milestone> {
        self.store
            .get_milestone(milestone_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("milestone {}", milestone_id)))
    }

    async fn attempt(&self, attempt_id: Uuid) -> EngineResult<MilestoneVerificationAttempt> {
        self.store
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("attempt {}", attempt_id)))
    }

    async fn open_attempt(
        &self,
        milestone: &Milestone,
    ) -> EngineResult<Option<MilestoneVerificationAttempt>> {
        match milestone.current_attempt_id {
            Some(id) if milestone.verification_status.map_or(false, VerificationStatus::is_open) => {
                Ok(Some(self.attempt(id).await?))
            }
            _ => Ok(None),
        }
    }

    async fn advance(
        &self,
        attempt: &mut MilestoneVerificationAttempt,
        next: VerificationStatus,
        actor: &Actor,
        detail: Option<&str>,
    ) -> EngineResult<()> {
        let from = self.transition(attempt, next).await?;
        let mut entry = NewAuditEntry::new(
            AuditEventKind::VerificationTransition,
            actor.id.as_str(),
            detail
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("{} -> {}", from.as_str(), next.as_str())),
        )
        .milestone(attempt.milestone_id)
        .status(next.as_str());
        if next == VerificationStatus::Failed {
            entry = entry.failed();
        }
        self.audit.record(entry).await?;
        Ok(())
    }

    async fn advance_timed(
        &self,
        attempt: &mut MilestoneVerificationAttempt,
        next: VerificationStatus,
        actor: &Actor,
        detail: &str,
        operation: OperationKind,
        started: Instant,
    ) -> EngineResult<()> {
        self.transition(attempt, next).await?;
        let mut entry = NewAuditEntry::new(
            AuditEventKind::VerificationTransition,
            actor.id.as_str(),
            detail,
        )
        .milestone(attempt.milestone_id)
        .status(next.as_str())
        .timed(operation, elapsed_ms(started));
        if next == VerificationStatus::Failed {
            entry = entry.failed();
        }
        self.audit.record(entry).await?;
        Ok(())
    }

    /// Compare-and-set the attempt's status, returning the status it left.
    async fn transition(
        &self,
        attempt: &mut MilestoneVerificationAttempt,
        next: VerificationStatus,
    ) -> EngineResult<VerificationStatus> {
        let from = attempt.status;
        if !from.can_transition_to(next) {
            return Err(EngineError::Validation(format!(
                "cannot move attempt from {} to {}",
                from.as_str(),
                next.as_str()
            )));
        }

        attempt.status = next;
        if self.store.transition_attempt(attempt, from).await? {
            return Ok(from);
        }

        // Lost the race, most likely to a concurrent override.
        attempt.status = from;
        let stored = self.attempt(attempt.id).await?;
        if stored.status.is_passing() {
            Err(EngineError::AlreadyVerified {
                milestone_id: attempt.milestone_id,
            })
        } else {
            Err(EngineError::VerificationInProgress {
                milestone_id: attempt.milestone_id,
                attempt_id: attempt.id,
            })
        }
    }

    async fn record_refusal(
        &self,
        milestone_id: Uuid,
        kind: AuditEventKind,
        actor: &Actor,
        err: &EngineError,
    ) -> EngineResult<()> {
        self.audit
            .record(
                NewAuditEntry::new(kind, actor.id.as_str(), err.to_string())
                    .milestone(milestone_id)
                    .status(err.kind())
                    .failed(),
            )
            .await?;
        Ok(())
    }

    async fn evaluate_targets(&self, milestone: &Milestone) -> EngineResult<Vec<MetricMeasurement>> {
        let feeds = self
            .store
            .list_feeds(Some(milestone.project_id), true)
            .await?;
        let now = Utc::now().timestamp();

        try_join_all(milestone.targets.iter().map(|target| {
            let feeds: Vec<&OracleFeed> = feeds
                .iter()
                .filter(|feed| feed.feed_type == target.feed_type)
                .collect();
            self.evaluate_target(milestone.id, target, feeds, now)
        }))
        .await
    }

    async fn evaluate_target(
        &self,
        milestone_id: Uuid,
        target: &MetricTarget,
        feeds: Vec<&OracleFeed>,
        now: i64,
    ) -> EngineResult<MetricMeasurement> {
        let started = Instant::now();
        let mut scored: Vec<ScoredPoint> = Vec::new();
        let mut rejected_points = 0;

        for feed in feeds {
            for point in self.store.latest_points_per_source(feed.id).await? {
                let reliability = self
                    .store
                    .source_reliability(&point.source_id)
                    .await?
                    .map_or(1.0, |r| r.weight);

                match self.filter.check(feed, &point, reliability, now) {
                    Ok(scored_point) => scored.push(scored_point),
                    Err(err) => {
                        rejected_points += 1;
                        self.audit
                            .record(
                                NewAuditEntry::new(
                                    rejection_kind(&err),
                                    Actor::system().id,
                                    format!("point {} excluded: {}", point.id, err),
                                )
                                .milestone(milestone_id)
                                .status(err.kind())
                                .failed(),
                            )
                            .await?;
                    }
                }
            }
        }

        let outcome = self.consensus.evaluate(&scored);

        let mut entry = NewAuditEntry::new(
            AuditEventKind::ConsensusEvaluated,
            Actor::system().id,
            format!(
                "{}: aggregate {:.3} over {} sources, confidence {}, deviating [{}]",
                target.feed_type,
                outcome.aggregate_value,
                outcome.included_sources.len(),
                confidence_pct(outcome.confidence),
                outcome.deviating_sources.join(", ")
            ),
        )
        .milestone(milestone_id)
        .timed(OperationKind::ConsensusEvaluation, elapsed_ms(started));
        if !outcome.consensus_reached {
            entry = entry.failed();
        }
        self.audit.record(entry).await?;

        // Only multi-source rounds say anything about an individual source.
        if scored.len() > 1 {
            for point in &scored {
                let current = self
                    .store
                    .source_reliability(&point.source_id)
                    .await?
                    .unwrap_or_else(|| SourceReliability::fresh(&point.source_id));
                let agreed = outcome.included_sources.contains(&point.source_id);
                let next = self.filter.scorer().next_reliability(&current, agreed);
                self.store.upsert_source_reliability(&next).await?;
            }
        }

        Ok(MetricMeasurement {
            feed_type: target.feed_type.clone(),
            target_value: target.target_value,
            aggregate_value: outcome.aggregate_value,
            consensus_reached: outcome.consensus_reached,
            confidence: outcome.confidence,
            included_sources: outcome.included_sources,
            deviating_sources: outcome.deviating_sources,
            rejected_points,
        })
    }
}

fn validate_evidence(evidence: &[Evidence]) -> EngineResult<()> {
    for item in evidence {
        item.validate_shape().map_err(EngineError::Validation)?;
    }
    Ok(())
}

fn claim_result(claim: AttemptClaim, milestone_id: Uuid) -> EngineResult<()> {
    match claim {
        AttemptClaim::Claimed => Ok(()),
        AttemptClaim::AlreadyVerified => Err(EngineError::AlreadyVerified { milestone_id }),
        AttemptClaim::AlreadyReleased => Err(EngineError::AlreadyReleased { milestone_id }),
        AttemptClaim::InProgress(attempt_id) => Err(EngineError::VerificationInProgress {
            milestone_id,
            attempt_id,
        }),
        AttemptClaim::MilestoneMissing => {
            Err(EngineError::NotFound(format!("milestone {}", milestone_id)))
        }
    }
}

/// Failure reason for a finished evaluation, or `None` when every target passed.
pub fn decide(
    measurements: &[MetricMeasurement],
    confidence: f64,
    min_confidence: f64,
) -> Option<VerificationFailure> {
    if measurements.is_empty() || measurements.iter().any(|m| !m.consensus_reached) {
        return Some(VerificationFailure::ConsensusNotReached);
    }
    if confidence + THRESHOLD_EPSILON < min_confidence {
        return Some(VerificationFailure::BelowConfidenceThreshold);
    }
    if measurements.iter().any(|m| !m.target_met()) {
        return Some(VerificationFailure::TargetNotMet);
    }
    None
}
