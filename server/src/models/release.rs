use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Why a release was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "trigger_reason", rename_all = "snake_case")]
pub enum TriggerReason {
    Automatic,
    ManualOverride,
}

/// Release transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "release_status", rename_all = "snake_case")]
pub enum ReleaseStatus {
    Pending,
    Processing,
    Confirmed,
    Failed,
}

/// Release policy attached to a fund allocation. Amounts are minor units (cents).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReleaseCondition {
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_confidence: f64,
    pub require_milestone_completion: bool,
    pub auto_release: bool,
    #[validate(range(min = 0))]
    pub high_value_threshold: i64,
    #[validate(range(min = 1, max = 16))]
    pub approval_threshold: u32,
    #[validate(range(min = 1, max = 10))]
    pub max_retries: u32,
    #[validate(range(min = 1))]
    pub backoff_base_ms: u64,
    #[validate(range(min = 1))]
    pub backoff_max_ms: u64,
}

impl Default for ReleaseCondition {
    fn default() -> Self {
        Self {
            min_confidence: 0.8,
            require_milestone_completion: true,
            auto_release: false,
            high_value_threshold: 1_000_000,
            approval_threshold: 2,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

/// Escrowed funds earmarked for one milestone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundAllocation {
    pub id: Uuid,
    pub milestone_id: Uuid,
    pub recipient: String,
    pub amount: i64,
    pub condition: ReleaseCondition,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Approval {
    pub allocation_id: Uuid,
    pub approver_id: String,
    pub approved_at: DateTime<Utc>,
}

/// One fund-release execution
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReleaseTransaction {
    pub id: Uuid,
    pub allocation_id: Uuid,
    pub milestone_id: Uuid,
    pub amount: i64,
    pub recipient: String,
    pub trigger_reason: TriggerReason,
    pub status: ReleaseStatus,
    pub retry_count: i32,
    pub external_ref: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReleaseTransaction {
    pub fn new(allocation: &FundAllocation, amount: i64, trigger_reason: TriggerReason) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            allocation_id: allocation.id,
            milestone_id: allocation.milestone_id,
            amount,
            recipient: allocation.recipient.clone(),
            trigger_reason,
            status: ReleaseStatus::Pending,
            retry_count: 0,
            external_ref: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Allocation creation payload
#[derive(Debug, Deserialize, Validate)]
pub struct CreateAllocationRequest {
    pub milestone_id: Uuid,
    #[validate(length(min = 1, max = 128))]
    pub recipient: String,
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate]
    pub condition: Option<ReleaseCondition>,
}

/// Release execution payload
#[derive(Debug, Deserialize, Validate)]
pub struct ExecuteReleaseRequest {
    #[validate(length(min = 1, max = 128))]
    pub recipient: String,
    #[validate(range(min = 1))]
    pub amount: i64,
    #[serde(default)]
    pub approvals: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseReceipt {
    pub transaction_id: Uuid,
    pub status: ReleaseStatus,
    pub external_ref: Option<String>,
    pub retry_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalCount {
    pub allocation_id: Uuid,
    pub approvals: usize,
}
