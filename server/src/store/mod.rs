//! Persistence contract for the engine.
//!
//! The two places that need mutual exclusion, claiming a milestone's current
//! verification attempt and reserving its release, are conditional updates
//! inside the store so concurrent callers get exactly one winner.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::{
    Approval, AuditEntry, AuditQuery, FundAllocation, Milestone, MilestoneVerificationAttempt,
    NewAuditEntry, OperationKind, OracleDataPoint, OracleFeed, ReleaseStatus, ReleaseTransaction,
    SourceReliability, VerificationStatus,
};

pub use memory::{MemoryAuditSink, MemoryStore};
pub use postgres::{PgAuditSink, PgStore};

/// Result of trying to open a new verification attempt on a milestone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptClaim {
    Claimed,
    AlreadyVerified,
    AlreadyReleased,
    InProgress(Uuid),
    MilestoneMissing,
}

/// Result of the release compare-and-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReservation {
    Reserved,
    AlreadyReserved,
    AlreadyConfirmed,
    MilestoneMissing,
}

#[async_trait]
pub trait EngineStore: Send + Sync {
    // ----- feeds -----
    async fn insert_feed(&self, feed: &OracleFeed) -> EngineResult<()>;
    async fn get_feed(&self, id: Uuid) -> EngineResult<Option<OracleFeed>>;
    async fn list_feeds(
        &self,
        project_id: Option<Uuid>,
        active_only: bool,
    ) -> EngineResult<Vec<OracleFeed>>;
    /// Returns false when the feed was unknown or already inactive.
    async fn deactivate_feed(&self, id: Uuid, at: DateTime<Utc>) -> EngineResult<bool>;

    // ----- data points -----
    /// Append a reading; false when `(feed, source, timestamp)` already exists.
    async fn insert_data_point(&self, point: &OracleDataPoint) -> EngineResult<bool>;
    /// Most recent reading of every source on a feed.
    async fn latest_points_per_source(&self, feed_id: Uuid) -> EngineResult<Vec<OracleDataPoint>>;

    // ----- source reliability -----
    async fn source_reliability(&self, source_id: &str) -> EngineResult<Option<SourceReliability>>;
    async fn upsert_source_reliability(&self, reliability: &SourceReliability) -> EngineResult<()>;

    // ----- milestones and attempts -----
    async fn insert_milestone(&self, milestone: &Milestone) -> EngineResult<()>;
    async fn get_milestone(&self, id: Uuid) -> EngineResult<Option<Milestone>>;
    /// Atomically make `attempt` the milestone's current attempt if no attempt is
    /// open, verified or released.
    async fn claim_attempt(&self, attempt: &MilestoneVerificationAttempt)
        -> EngineResult<AttemptClaim>;
    /// Persist `attempt` only if its stored status is still `from`. Mirrors the
    /// new status onto the milestone.
    async fn transition_attempt(
        &self,
        attempt: &MilestoneVerificationAttempt,
        from: VerificationStatus,
    ) -> EngineResult<bool>;
    async fn get_attempt(&self, id: Uuid) -> EngineResult<Option<MilestoneVerificationAttempt>>;
    /// Newest first.
    async fn list_attempts(&self, milestone_id: Uuid)
        -> EngineResult<Vec<MilestoneVerificationAttempt>>;

    // ----- allocations and approvals -----
    async fn insert_allocation(&self, allocation: &FundAllocation) -> EngineResult<()>;
    async fn get_allocation(&self, id: Uuid) -> EngineResult<Option<FundAllocation>>;
    async fn list_allocations(&self, milestone_id: Uuid) -> EngineResult<Vec<FundAllocation>>;
    /// False when the approver already approved this allocation.
    async fn add_approval(&self, approval: &Approval) -> EngineResult<bool>;
    async fn list_approvals(&self, allocation_id: Uuid) -> EngineResult<Vec<Approval>>;

    // ----- releases -----
    /// Compare-and-set `Open -> Reserved` on the milestone's release state.
    async fn reserve_release(&self, milestone_id: Uuid) -> EngineResult<ReleaseReservation>;
    /// `Reserved -> Confirmed` when `confirmed`, otherwise `Reserved -> Open`.
    async fn settle_release(&self, milestone_id: Uuid, confirmed: bool) -> EngineResult<()>;
    async fn insert_release(&self, release: &ReleaseTransaction) -> EngineResult<()>;
    async fn update_release(&self, release: &ReleaseTransaction) -> EngineResult<()>;
    async fn get_release(&self, id: Uuid) -> EngineResult<Option<ReleaseTransaction>>;
    /// Newest first.
    async fn list_releases(&self, milestone_id: Uuid) -> EngineResult<Vec<ReleaseTransaction>>;

    async fn count_releases(
        &self,
        milestone_id: Uuid,
        status: ReleaseStatus,
    ) -> EngineResult<usize> {
        Ok(self
            .list_releases(milestone_id)
            .await?
            .iter()
            .filter(|release| release.status == status)
            .count())
    }
}

/// Append-only destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Store the entry, assigning the next sequence number.
    async fn append(&self, entry: NewAuditEntry) -> EngineResult<AuditEntry>;
    /// Matching entries, newest first.
    async fn query(&self, filter: &AuditQuery) -> EngineResult<Vec<AuditEntry>>;
    /// Recorded durations, optionally for one operation kind.
    async fn durations(
        &self,
        operation: Option<OperationKind>,
    ) -> EngineResult<Vec<(OperationKind, i64)>>;
    /// Delete entries created before `cutoff`, returning how many were removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> EngineResult<u64>;
}
