use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::oracle::FeedType;

/// Lifecycle of one verification attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "verification_status", rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    InProgress,
    Verified,
    Failed,
    ManualOverride,
}

impl VerificationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VerificationStatus::Verified
                | VerificationStatus::Failed
                | VerificationStatus::ManualOverride
        )
    }

    /// Statuses that unlock a fund release.
    pub fn is_passing(self) -> bool {
        matches!(
            self,
            VerificationStatus::Verified | VerificationStatus::ManualOverride
        )
    }

    pub fn is_open(self) -> bool {
        matches!(
            self,
            VerificationStatus::Pending | VerificationStatus::InProgress
        )
    }

    pub fn can_transition_to(self, next: VerificationStatus) -> bool {
        use VerificationStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, ManualOverride)
                | (InProgress, Verified)
                | (InProgress, Failed)
                | (InProgress, ManualOverride)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerificationStatus::Pending => "PENDING",
            VerificationStatus::InProgress => "IN_PROGRESS",
            VerificationStatus::Verified => "VERIFIED",
            VerificationStatus::Failed => "FAILED",
            VerificationStatus::ManualOverride => "MANUAL_OVERRIDE",
        }
    }
}

/// Release progress of a milestone. `Reserved` is held by exactly one release in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "release_state", rename_all = "snake_case")]
pub enum ReleaseState {
    Open,
    Reserved,
    Confirmed,
}

/// Numeric threshold a milestone must reach on one kind of feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTarget {
    pub feed_type: FeedType,
    pub target_value: f64,
}

/// Funded project milestone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: Uuid,
    pub project_id: Uuid,
    pub index: i32,
    pub title: String,
    pub targets: Vec<MetricTarget>,
    pub due_date: Option<DateTime<Utc>>,
    pub current_attempt_id: Option<Uuid>,
    pub verification_status: Option<VerificationStatus>,
    pub release_state: ReleaseState,
    pub created_at: DateTime<Utc>,
}

impl Milestone {
    pub fn is_verified(&self) -> bool {
        self.verification_status.map_or(false, VerificationStatus::is_passing)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_verified() && self.due_date.map_or(false, |due| now > due)
    }
}

/// Supporting evidence attached to a verification or override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Evidence {
    MeterReading { meter_id: String, reading_kwh: f64 },
    Document { uri: String, sha256: String },
    InspectionReport { inspector: String, summary: String },
    DataPointRefs { point_ids: Vec<Uuid> },
}

impl Evidence {
    pub fn validate_shape(&self) -> Result<(), String> {
        match self {
            Evidence::MeterReading { meter_id, reading_kwh } => {
                if meter_id.trim().is_empty() {
                    return Err("meter_id must not be empty".into());
                }
                if !reading_kwh.is_finite() || *reading_kwh < 0.0 {
                    return Err("reading_kwh must be a non-negative number".into());
                }
            }
            Evidence::Document { uri, sha256 } => {
                if uri.trim().is_empty() {
                    return Err("document uri must not be empty".into());
                }
                if sha256.len() != 64 || hex::decode(sha256).is_err() {
                    return Err("document sha256 must be 64 hex characters".into());
                }
            }
            Evidence::InspectionReport { inspector, summary } => {
                if inspector.trim().is_empty() || summary.trim().is_empty() {
                    return Err("inspection report needs an inspector and a summary".into());
                }
            }
            Evidence::DataPointRefs { point_ids } => {
                if point_ids.is_empty() {
                    return Err("data point reference list is empty".into());
                }
            }
        }
        Ok(())
    }
}

/// Consensus result for one milestone target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricMeasurement {
    pub feed_type: FeedType,
    pub target_value: f64,
    pub aggregate_value: f64,
    pub consensus_reached: bool,
    pub confidence: f64,
    pub included_sources: Vec<String>,
    pub deviating_sources: Vec<String>,
    pub rejected_points: usize,
}

impl MetricMeasurement {
    pub fn target_met(&self) -> bool {
        self.consensus_reached && self.aggregate_value >= self.target_value
    }
}

/// Why an attempt ended in FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationFailure {
    ConsensusNotReached,
    BelowConfidenceThreshold,
    TargetNotMet,
}

impl VerificationFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationFailure::ConsensusNotReached => "ConsensusNotReached",
            VerificationFailure::BelowConfidenceThreshold => "BelowConfidenceThreshold",
            VerificationFailure::TargetNotMet => "TargetNotMet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ConsensusNotReached" => Some(VerificationFailure::ConsensusNotReached),
            "BelowConfidenceThreshold" => Some(VerificationFailure::BelowConfidenceThreshold),
            "TargetNotMet" => Some(VerificationFailure::TargetNotMet),
            _ => None,
        }
    }
}

/// One evaluation run for a milestone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneVerificationAttempt {
    pub id: Uuid,
    pub milestone_id: Uuid,
    pub status: VerificationStatus,
    pub confidence: f64,
    pub measurements: Vec<MetricMeasurement>,
    pub evidence: Vec<Evidence>,
    pub verified_by: String,
    pub failure_reason: Option<VerificationFailure>,
    pub justification: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MilestoneVerificationAttempt {
    pub fn new(milestone_id: Uuid, actor: &str, evidence: Vec<Evidence>) -> Self {
        Self {
            id: Uuid::new_v4(),
            milestone_id,
            status: VerificationStatus::Pending,
            confidence: 0.0,
            measurements: Vec::new(),
            evidence,
            verified_by: actor.to_string(),
            failure_reason: None,
            justification: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Milestone registration payload
#[derive(Debug, Deserialize, Validate)]
pub struct CreateMilestoneRequest {
    pub project_id: Uuid,
    #[validate(range(min = 0))]
    pub index: i32,
    #[validate(length(min = 1, max = 128))]
    pub title: String,
    #[validate(length(min = 1))]
    pub targets: Vec<MetricTarget>,
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitVerificationRequest {
    #[serde(default)]
    pub evidence: Vec<Evidence>,
}

#[derive(Debug, Deserialize)]
pub struct OverrideVerificationRequest {
    pub justification: String,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
}

/// Result of `submit_verification`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReceipt {
    pub attempt_id: Uuid,
    pub status: VerificationStatus,
    /// 0-100
    pub confidence: u8,
    pub failure_reason: Option<VerificationFailure>,
    pub measurements: Vec<MetricMeasurement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptView {
    pub attempt_id: Uuid,
    pub status: VerificationStatus,
    pub confidence: u8,
    pub verified_by: String,
    pub failure_reason: Option<VerificationFailure>,
    pub justification: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&MilestoneVerificationAttempt> for AttemptView {
    fn from(attempt: &MilestoneVerificationAttempt) -> Self {
        Self {
            attempt_id: attempt.id,
            status: attempt.status,
            confidence: super::confidence_pct(attempt.confidence),
            verified_by: attempt.verified_by.clone(),
            failure_reason: attempt.failure_reason,
            justification: attempt.justification.clone(),
            started_at: attempt.started_at,
            completed_at: attempt.completed_at,
        }
    }
}

/// Response of `get_verification_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationStatusView {
    pub milestone_id: Uuid,
    pub status: Option<VerificationStatus>,
    pub confidence: u8,
    pub current_attempt_id: Option<Uuid>,
    pub release_state: ReleaseState,
    pub overdue: bool,
    pub history: Vec<AttemptView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_lifecycle() {
        use VerificationStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(ManualOverride));
        assert!(InProgress.can_transition_to(Verified));
        assert!(InProgress.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(ManualOverride));

        assert!(!Pending.can_transition_to(Verified));
        assert!(!Failed.can_transition_to(ManualOverride));
        assert!(!Verified.can_transition_to(ManualOverride));
        assert!(!ManualOverride.can_transition_to(Verified));
        for status in [Verified, Failed, ManualOverride] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn evidence_rejects_unknown_shapes() {
        let ok: Evidence = serde_json::from_str(
            r#"{"kind":"meter_reading","meter_id":"m-1","reading_kwh":12.5}"#,
        )
        .unwrap();
        assert!(ok.validate_shape().is_ok());

        let unknown_kind =
            serde_json::from_str::<Evidence>(r#"{"kind":"photo","url":"x"}"#);
        assert!(unknown_kind.is_err());

        let missing_field =
            serde_json::from_str::<Evidence>(r#"{"kind":"document","uri":"ipfs://abc"}"#);
        assert!(missing_field.is_err());

        let bad_hash = Evidence::Document {
            uri: "ipfs://abc".into(),
            sha256: "xyz".into(),
        };
        assert!(bad_hash.validate_shape().is_err());
    }

    #[test]
    fn overdue_only_when_unverified_past_due() {
        let now = Utc::now();
        let mut milestone = Milestone {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            index: 0,
            title: "Array commissioning".into(),
            targets: vec![],
            due_date: Some(now - chrono::Duration::days(1)),
            current_attempt_id: None,
            verification_status: None,
            release_state: ReleaseState::Open,
            created_at: now,
        };
        assert!(milestone.is_overdue(now));
        milestone.verification_status = Some(VerificationStatus::Verified);
        assert!(!milestone.is_overdue(now));
    }
}
