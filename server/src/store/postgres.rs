//! PostgreSQL persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{AttemptClaim, AuditSink, EngineStore, ReleaseReservation};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Approval, AuditEntry, AuditQuery, Evidence, FeedSource, FundAllocation, MetricMeasurement,
    MetricTarget, Milestone, MilestoneVerificationAttempt, NewAuditEntry, OperationKind,
    OracleDataPoint, OracleFeed, ReleaseCondition, ReleaseState, ReleaseStatus,
    ReleaseTransaction, SourceReliability, VerificationFailure, VerificationStatus,
};

#[derive(sqlx::FromRow)]
struct FeedRow {
    id: Uuid,
    project_id: Uuid,
    address: String,
    feed_type: String,
    update_interval_secs: i64,
    max_staleness_secs: i64,
    min_confidence: f64,
    endpoint_url: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    deactivated_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct FeedSourceRow {
    feed_id: Uuid,
    source_id: String,
    public_key: String,
}

impl FeedRow {
    fn into_feed(self, sources: Vec<FeedSource>) -> EngineResult<OracleFeed> {
        let feed_type = self.feed_type.parse().map_err(EngineError::Storage)?;
        Ok(OracleFeed {
            id: self.id,
            project_id: self.project_id,
            address: self.address,
            feed_type,
            update_interval_secs: self.update_interval_secs,
            max_staleness_secs: self.max_staleness_secs,
            min_confidence: self.min_confidence,
            endpoint_url: self.endpoint_url,
            sources,
            is_active: self.is_active,
            created_at: self.created_at,
            deactivated_at: self.deactivated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MilestoneRow {
    id: Uuid,
    project_id: Uuid,
    position: i32,
    title: String,
    targets: Json<Vec<MetricTarget>>,
    due_date: Option<DateTime<Utc>>,
    current_attempt_id: Option<Uuid>,
    verification_status: Option<VerificationStatus>,
    release_state: ReleaseState,
    created_at: DateTime<Utc>,
}

impl From<MilestoneRow> for Milestone {
    fn from(row: MilestoneRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project_id,
            index: row.position,
            title: row.title,
            targets: row.targets.0,
            due_date: row.due_date,
            current_attempt_id: row.current_attempt_id,
            verification_status: row.verification_status,
            release_state: row.release_state,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    milestone_id: Uuid,
    status: VerificationStatus,
    confidence: f64,
    measurements: Json<Vec<MetricMeasurement>>,
    evidence: Json<Vec<Evidence>>,
    verified_by: String,
    failure_reason: Option<String>,
    justification: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<AttemptRow> for MilestoneVerificationAttempt {
    fn from(row: AttemptRow) -> Self {
        Self {
            id: row.id,
            milestone_id: row.milestone_id,
            status: row.status,
            confidence: row.confidence,
            measurements: row.measurements.0,
            evidence: row.evidence.0,
            verified_by: row.verified_by,
            failure_reason: row.failure_reason.as_deref().and_then(VerificationFailure::parse),
            justification: row.justification,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AllocationRow {
    id: Uuid,
    milestone_id: Uuid,
    recipient: String,
    amount: i64,
    condition: Json<ReleaseCondition>,
    created_at: DateTime<Utc>,
}

impl From<AllocationRow> for FundAllocation {
    fn from(row: AllocationRow) -> Self {
        Self {
            id: row.id,
            milestone_id: row.milestone_id,
            recipient: row.recipient,
            amount: row.amount,
            condition: row.condition.0,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    release_state: ReleaseState,
    verification_status: Option<VerificationStatus>,
    current_attempt_id: Option<Uuid>,
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    async fn sources_for(&self, feed_ids: &[Uuid]) -> EngineResult<Vec<FeedSourceRow>> {
        let rows = sqlx::query_as::<_, FeedSourceRow>(
            "SELECT feed_id, source_id, public_key FROM feed_sources WHERE feed_id = ANY($1) ORDER BY source_id",
        )
        .bind(feed_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl EngineStore for PgStore {
    async fn insert_feed(&self, feed: &OracleFeed) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO oracle_feeds (
                id, project_id, address, feed_type, update_interval_secs,
                max_staleness_secs, min_confidence, endpoint_url, is_active, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(feed.id)
        .bind(feed.project_id)
        .bind(&feed.address)
        .bind(feed.feed_type.to_string())
        .bind(feed.update_interval_secs)
        .bind(feed.max_staleness_secs)
        .bind(feed.min_confidence)
        .bind(&feed.endpoint_url)
        .bind(feed.is_active)
        .bind(feed.created_at)
        .execute(&mut *tx)
        .await?;

        for source in &feed.sources {
            sqlx::query(
                "INSERT INTO feed_sources (feed_id, source_id, public_key) VALUES ($1, $2, $3)",
            )
            .bind(feed.id)
            .bind(&source.source_id)
            .bind(&source.public_key)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_feed(&self, id: Uuid) -> EngineResult<Option<OracleFeed>> {
        let row = sqlx::query_as::<_, FeedRow>("SELECT * FROM oracle_feeds WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let sources = self
            .sources_for(&[id])
            .await?
            .into_iter()
            .map(|s| FeedSource {
                source_id: s.source_id,
                public_key: s.public_key,
            })
            .collect();
        row.into_feed(sources).map(Some)
    }

    async fn list_feeds(
        &self,
        project_id: Option<Uuid>,
        active_only: bool,
    ) -> EngineResult<Vec<OracleFeed>> {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> =
            sqlx::QueryBuilder::new("SELECT * FROM oracle_feeds WHERE 1=1");
        if let Some(project_id) = project_id {
            query_builder.push(" AND project_id = ");
            query_builder.push_bind(project_id);
        }
        if active_only {
            query_builder.push(" AND is_active = TRUE");
        }
        query_builder.push(" ORDER BY created_at");

        let rows = query_builder
            .build_query_as::<FeedRow>()
            .fetch_all(&self.pool)
            .await?;

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let sources = self.sources_for(&ids).await?;

        rows.into_iter()
            .map(|row| {
                let feed_sources = sources
                    .iter()
                    .filter(|s| s.feed_id == row.id)
                    .map(|s| FeedSource {
                        source_id: s.source_id.clone(),
                        public_key: s.public_key.clone(),
                    })
                    .collect();
                row.into_feed(feed_sources)
            })
            .collect()
    }

    async fn deactivate_feed(&self, id: Uuid, at: DateTime<Utc>) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE oracle_feeds SET is_active = FALSE, deactivated_at = $2 WHERE id = $1 AND is_active",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_data_point(&self, point: &OracleDataPoint) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO oracle_data_points (
                id, feed_id, source_id, value, confidence, timestamp, signature, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (feed_id, source_id, timestamp) DO NOTHING
            "#,
        )
        .bind(point.id)
        .bind(point.feed_id)
        .bind(&point.source_id)
        .bind(point.value)
        .bind(point.confidence)
        .bind(point.timestamp)
        .bind(&point.signature)
        .bind(point.received_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn latest_points_per_source(&self, feed_id: Uuid) -> EngineResult<Vec<OracleDataPoint>> {
        let points = sqlx::query_as::<_, OracleDataPoint>(
            r#"
            SELECT DISTINCT ON (source_id) *
            FROM oracle_data_points
            WHERE feed_id = $1
            ORDER BY source_id, timestamp DESC
            "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(points)
    }

    async fn source_reliability(&self, source_id: &str) -> EngineResult<Option<SourceReliability>> {
        let row = sqlx::query_as::<_, SourceReliability>(
            "SELECT * FROM source_reliability WHERE source_id = $1",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_source_reliability(&self, reliability: &SourceReliability) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO source_reliability (source_id, weight, observations, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_id) DO UPDATE
            SET weight = EXCLUDED.weight,
                observations = EXCLUDED.observations,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&reliability.source_id)
        .bind(reliability.weight)
        .bind(reliability.observations)
        .bind(reliability.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_milestone(&self, milestone: &Milestone) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO milestones (
                id, project_id, position, title, targets, due_date,
                current_attempt_id, verification_status, release_state, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(milestone.id)
        .bind(milestone.project_id)
        .bind(milestone.index)
        .bind(&milestone.title)
        .bind(Json(&milestone.targets))
        .bind(milestone.due_date)
        .bind(milestone.current_attempt_id)
        .bind(milestone.verification_status)
        .bind(milestone.release_state)
        .bind(milestone.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_milestone(&self, id: Uuid) -> EngineResult<Option<Milestone>> {
        let row = sqlx::query_as::<_, MilestoneRow>("SELECT * FROM milestones WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Milestone::from))
    }

    async fn claim_attempt(
        &self,
        attempt: &MilestoneVerificationAttempt,
    ) -> EngineResult<AttemptClaim> {
        let mut tx = self.pool.begin().await?;

        // Row lock serialises concurrent claims on the same milestone.
        let current = sqlx::query_as::<_, ClaimRow>(
            r#"
            SELECT release_state, verification_status, current_attempt_id
            FROM milestones WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(attempt.milestone_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = current else {
            return Ok(AttemptClaim::MilestoneMissing);
        };
        if current.release_state == ReleaseState::Confirmed {
            return Ok(AttemptClaim::AlreadyReleased);
        }
        match (current.verification_status, current.current_attempt_id) {
            (Some(status), _) if status.is_passing() => return Ok(AttemptClaim::AlreadyVerified),
            (Some(status), Some(open)) if status.is_open() => {
                return Ok(AttemptClaim::InProgress(open))
            }
            _ => {}
        }

        sqlx::query(
            r#"
            INSERT INTO verification_attempts (
                id, milestone_id, status, confidence, measurements, evidence,
                verified_by, failure_reason, justification, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.milestone_id)
        .bind(attempt.status)
        .bind(attempt.confidence)
        .bind(Json(&attempt.measurements))
        .bind(Json(&attempt.evidence))
        .bind(&attempt.verified_by)
        .bind(attempt.failure_reason.map(VerificationFailure::as_str))
        .bind(&attempt.justification)
        .bind(attempt.started_at)
        .bind(attempt.completed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE milestones SET current_attempt_id = $2, verification_status = $3 WHERE id = $1",
        )
        .bind(attempt.milestone_id)
        .bind(attempt.id)
        .bind(attempt.status)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(AttemptClaim::Claimed)
    }

    async fn transition_attempt(
        &self,
        attempt: &MilestoneVerificationAttempt,
        from: VerificationStatus,
    ) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE verification_attempts
            SET status = $3, confidence = $4, measurements = $5, evidence = $6,
                failure_reason = $7, justification = $8, completed_at = $9, verified_by = $10
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(attempt.id)
        .bind(from)
        .bind(attempt.status)
        .bind(attempt.confidence)
        .bind(Json(&attempt.measurements))
        .bind(Json(&attempt.evidence))
        .bind(attempt.failure_reason.map(VerificationFailure::as_str))
        .bind(&attempt.justification)
        .bind(attempt.completed_at)
        .bind(&attempt.verified_by)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE milestones SET verification_status = $3 WHERE id = $1 AND current_attempt_id = $2",
        )
        .bind(attempt.milestone_id)
        .bind(attempt.id)
        .bind(attempt.status)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_attempt(&self, id: Uuid) -> EngineResult<Option<MilestoneVerificationAttempt>> {
        let row =
            sqlx::query_as::<_, AttemptRow>("SELECT * FROM verification_attempts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(MilestoneVerificationAttempt::from))
    }

    async fn list_attempts(
        &self,
        milestone_id: Uuid,
    ) -> EngineResult<Vec<MilestoneVerificationAttempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            "SELECT * FROM verification_attempts WHERE milestone_id = $1 ORDER BY started_at DESC",
        )
        .bind(milestone_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(MilestoneVerificationAttempt::from).collect())
    }

    async fn insert_allocation(&self, allocation: &FundAllocation) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fund_allocations (id, milestone_id, recipient, amount, condition, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(allocation.id)
        .bind(allocation.milestone_id)
        .bind(&allocation.recipient)
        .bind(allocation.amount)
        .bind(Json(&allocation.condition))
        .bind(allocation.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_allocation(&self, id: Uuid) -> EngineResult<Option<FundAllocation>> {
        let row = sqlx::query_as::<_, AllocationRow>("SELECT * FROM fund_allocations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(FundAllocation::from))
    }

    async fn list_allocations(&self, milestone_id: Uuid) -> EngineResult<Vec<FundAllocation>> {
        let rows = sqlx::query_as::<_, AllocationRow>(
            "SELECT * FROM fund_allocations WHERE milestone_id = $1 ORDER BY created_at",
        )
        .bind(milestone_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FundAllocation::from).collect())
    }

    async fn add_approval(&self, approval: &Approval) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO allocation_approvals (allocation_id, approver_id, approved_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (allocation_id, approver_id) DO NOTHING
            "#,
        )
        .bind(approval.allocation_id)
        .bind(&approval.approver_id)
        .bind(approval.approved_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_approvals(&self, allocation_id: Uuid) -> EngineResult<Vec<Approval>> {
        let approvals = sqlx::query_as::<_, Approval>(
            "SELECT * FROM allocation_approvals WHERE allocation_id = $1 ORDER BY approved_at",
        )
        .bind(allocation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(approvals)
    }

    async fn reserve_release(&self, milestone_id: Uuid) -> EngineResult<ReleaseReservation> {
        let result = sqlx::query(
            "UPDATE milestones SET release_state = $2 WHERE id = $1 AND release_state = $3",
        )
        .bind(milestone_id)
        .bind(ReleaseState::Reserved)
        .bind(ReleaseState::Open)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(ReleaseReservation::Reserved);
        }

        let state: Option<ReleaseState> =
            sqlx::query_scalar("SELECT release_state FROM milestones WHERE id = $1")
                .bind(milestone_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(match state {
            None => ReleaseReservation::MilestoneMissing,
            Some(ReleaseState::Confirmed) => ReleaseReservation::AlreadyConfirmed,
            // Open here means another caller reserved and released it in between.
            Some(_) => ReleaseReservation::AlreadyReserved,
        })
    }

    async fn settle_release(&self, milestone_id: Uuid, confirmed: bool) -> EngineResult<()> {
        let next = if confirmed {
            ReleaseState::Confirmed
        } else {
            ReleaseState::Open
        };
        sqlx::query("UPDATE milestones SET release_state = $2 WHERE id = $1 AND release_state = $3")
            .bind(milestone_id)
            .bind(next)
            .bind(ReleaseState::Reserved)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_release(&self, release: &ReleaseTransaction) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO release_transactions (
                id, allocation_id, milestone_id, amount, recipient, trigger_reason,
                status, retry_count, external_ref, last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(release.id)
        .bind(release.allocation_id)
        .bind(release.milestone_id)
        .bind(release.amount)
        .bind(&release.recipient)
        .bind(release.trigger_reason)
        .bind(release.status)
        .bind(release.retry_count)
        .bind(&release.external_ref)
        .bind(&release.last_error)
        .bind(release.created_at)
        .bind(release.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_release(&self, release: &ReleaseTransaction) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE release_transactions
            SET status = $2, retry_count = $3, external_ref = $4, last_error = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(release.id)
        .bind(release.status)
        .bind(release.retry_count)
        .bind(&release.external_ref)
        .bind(&release.last_error)
        .bind(release.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("release {}", release.id)));
        }
        Ok(())
    }

    async fn get_release(&self, id: Uuid) -> EngineResult<Option<ReleaseTransaction>> {
        let release = sqlx::query_as::<_, ReleaseTransaction>(
            "SELECT * FROM release_transactions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(release)
    }

    async fn list_releases(&self, milestone_id: Uuid) -> EngineResult<Vec<ReleaseTransaction>> {
        let releases = sqlx::query_as::<_, ReleaseTransaction>(
            "SELECT * FROM release_transactions WHERE milestone_id = $1 ORDER BY created_at DESC",
        )
        .bind(milestone_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(releases)
    }

    async fn count_releases(
        &self,
        milestone_id: Uuid,
        status: ReleaseStatus,
    ) -> EngineResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM release_transactions WHERE milestone_id = $1 AND status = $2",
        )
        .bind(milestone_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }
}

pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn append(&self, entry: NewAuditEntry) -> EngineResult<AuditEntry> {
        let stored = sqlx::query_as::<_, AuditEntry>(
            r#"
            INSERT INTO audit_entries (
                id, milestone_id, kind, outcome, status, actor, detail,
                operation, duration_ms, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(entry.id)
        .bind(entry.milestone_id)
        .bind(entry.kind)
        .bind(entry.outcome)
        .bind(&entry.status)
        .bind(&entry.actor)
        .bind(&entry.detail)
        .bind(entry.operation)
        .bind(entry.duration_ms)
        .bind(entry.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(stored)
    }

    async fn query(&self, filter: &AuditQuery) -> EngineResult<Vec<AuditEntry>> {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> =
            sqlx::QueryBuilder::new("SELECT * FROM audit_entries WHERE 1=1");

        if let Some(milestone_id) = filter.milestone_id {
            query_builder.push(" AND milestone_id = ");
            query_builder.push_bind(milestone_id);
        }
        if let Some(kind) = filter.kind {
            query_builder.push(" AND kind = ");
            query_builder.push_bind(kind);
        }
        if let Some(outcome) = filter.outcome {
            query_builder.push(" AND outcome = ");
            query_builder.push_bind(outcome);
        }
        if let Some(status) = &filter.status {
            query_builder.push(" AND status = ");
            query_builder.push_bind(status.clone());
        }
        if let Some(from) = filter.from {
            query_builder.push(" AND created_at >= ");
            query_builder.push_bind(from);
        }
        if let Some(to) = filter.to {
            query_builder.push(" AND created_at <= ");
            query_builder.push_bind(to);
        }

        query_builder.push(" ORDER BY created_at DESC, sequence DESC");
        if let Some(limit) = filter.limit.filter(|limit| *limit > 0) {
            query_builder.push(" LIMIT ");
            query_builder.push_bind(limit);
        }

        let entries = query_builder
            .build_query_as::<AuditEntry>()
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    async fn durations(
        &self,
        operation: Option<OperationKind>,
    ) -> EngineResult<Vec<(OperationKind, i64)>> {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "SELECT operation, duration_ms FROM audit_entries \
             WHERE operation IS NOT NULL AND duration_ms IS NOT NULL",
        );
        if let Some(operation) = operation {
            query_builder.push(" AND operation = ");
            query_builder.push_bind(operation);
        }

        let samples = query_builder
            .build_query_as::<(OperationKind, i64)>()
            .fetch_all(&self.pool)
            .await?;
        Ok(samples)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> EngineResult<u64> {
        let result = sqlx::query("DELETE FROM audit_entries WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
