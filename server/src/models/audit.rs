use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "audit_event_kind", rename_all = "snake_case")]
pub enum AuditEventKind {
    VerificationStarted,
    VerificationTransition,
    SignatureRejected,
    StaleDataRejected,
    ConsensusEvaluated,
    ReleaseDecision,
    ReleaseExecution,
    FeedSubscribed,
    FeedDeactivated,
    DataPointRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "audit_outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// Operations whose latency is tracked for percentile statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "operation_kind", rename_all = "snake_case")]
pub enum OperationKind {
    Verification,
    ConsensusEvaluation,
    Override,
    Release,
    LedgerSubmission,
    FeedPoll,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        OperationKind::Verification,
        OperationKind::ConsensusEvaluation,
        OperationKind::Override,
        OperationKind::Release,
        OperationKind::LedgerSubmission,
        OperationKind::FeedPoll,
    ];
}

/// Immutable record of one decision or transition
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub sequence: i64,
    pub milestone_id: Option<Uuid>,
    pub kind: AuditEventKind,
    pub outcome: AuditOutcome,
    pub status: Option<String>,
    pub actor: String,
    pub detail: String,
    pub operation: Option<OperationKind>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Entry as handed to a sink; the sink assigns `sequence`.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub id: Uuid,
    pub milestone_id: Option<Uuid>,
    pub kind: AuditEventKind,
    pub outcome: AuditOutcome,
    pub status: Option<String>,
    pub actor: String,
    pub detail: String,
    pub operation: Option<OperationKind>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl NewAuditEntry {
    pub fn new(kind: AuditEventKind, actor: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            milestone_id: None,
            kind,
            outcome: AuditOutcome::Success,
            status: None,
            actor: actor.into(),
            detail: detail.into(),
            operation: None,
            duration_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn milestone(mut self, milestone_id: Uuid) -> Self {
        self.milestone_id = Some(milestone_id);
        self
    }

    pub fn failed(mut self) -> Self {
        self.outcome = AuditOutcome::Failure;
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn timed(mut self, operation: OperationKind, duration_ms: i64) -> Self {
        self.operation = Some(operation);
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn into_entry(self, sequence: i64) -> AuditEntry {
        AuditEntry {
            id: self.id,
            sequence,
            milestone_id: self.milestone_id,
            kind: self.kind,
            outcome: self.outcome,
            status: self.status,
            actor: self.actor,
            detail: self.detail,
            operation: self.operation,
            duration_ms: self.duration_ms,
            created_at: self.created_at,
        }
    }
}

/// Audit query filters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub milestone_id: Option<Uuid>,
    pub kind: Option<AuditEventKind>,
    pub outcome: Option<AuditOutcome>,
    pub status: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl AuditQuery {
    pub fn for_milestone(milestone_id: Uuid) -> Self {
        Self {
            milestone_id: Some(milestone_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.milestone_id.map_or(true, |id| entry.milestone_id == Some(id))
            && self.kind.map_or(true, |kind| entry.kind == kind)
            && self.outcome.map_or(true, |outcome| entry.outcome == outcome)
            && self
                .status
                .as_deref()
                .map_or(true, |status| entry.status.as_deref() == Some(status))
            && self.from.map_or(true, |from| entry.created_at >= from)
            && self.to.map_or(true, |to| entry.created_at <= to)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrailQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceQuery {
    pub operation: Option<OperationKind>,
}

/// Latency percentiles for one operation kind, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub operation: OperationKind,
    pub p50: i64,
    pub p95: i64,
    pub p99: i64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindCount {
    pub kind: AuditEventKind,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub success_rate: f64,
    pub average_duration_ms: Option<f64>,
    pub by_kind: Vec<KindCount>,
}
