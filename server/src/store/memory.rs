//! In-process store, used when no database is configured and in tests

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AttemptClaim, AuditSink, EngineStore, ReleaseReservation};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Approval, AuditEntry, AuditQuery, FundAllocation, Milestone, MilestoneVerificationAttempt,
    NewAuditEntry, OperationKind, OracleDataPoint, OracleFeed, ReleaseState, ReleaseTransaction,
    SourceReliability, VerificationStatus,
};

#[derive(Default)]
struct Inner {
    feeds: HashMap<Uuid, OracleFeed>,
    points: Vec<OracleDataPoint>,
    reliability: HashMap<String, SourceReliability>,
    milestones: HashMap<Uuid, Milestone>,
    attempts: Vec<MilestoneVerificationAttempt>,
    allocations: Vec<FundAllocation>,
    approvals: Vec<Approval>,
    releases: Vec<ReleaseTransaction>,
}

/// Every check-and-set runs under one lock, which gives the same single-winner
/// behaviour as the conditional updates in Postgres.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn insert_feed(&self, feed: &OracleFeed) -> EngineResult<()> {
        self.inner.lock().await.feeds.insert(feed.id, feed.clone());
        Ok(())
    }

    async fn get_feed(&self, id: Uuid) -> EngineResult<Option<OracleFeed>> {
        Ok(self.inner.lock().await.feeds.get(&id).cloned())
    }

    async fn list_feeds(
        &self,
        project_id: Option<Uuid>,
        active_only: bool,
    ) -> EngineResult<Vec<OracleFeed>> {
        let inner = self.inner.lock().await;
        let mut feeds: Vec<OracleFeed> = inner
            .feeds
            .values()
            .filter(|feed| project_id.map_or(true, |id| feed.project_id == id))
            .filter(|feed| !active_only || feed.is_active)
            .cloned()
            .collect();
        feeds.sort_by_key(|feed| feed.created_at);
        Ok(feeds)
    }

    async fn deactivate_feed(&self, id: Uuid, at: DateTime<Utc>) -> EngineResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.feeds.get_mut(&id) {
            Some(feed) if feed.is_active => {
                feed.is_active = false;
                feed.deactivated_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_data_point(&self, point: &OracleDataPoint) -> EngineResult<bool> {
        let mut inner = self.inner.lock().await;
        let duplicate = inner.points.iter().any(|existing| {
            existing.feed_id == point.feed_id
                && existing.source_id == point.source_id
                && existing.timestamp == point.timestamp
        });
        if duplicate {
            return Ok(false);
        }
        inner.points.push(point.clone());
        Ok(true)
    }

    async fn latest_points_per_source(&self, feed_id: Uuid) -> EngineResult<Vec<OracleDataPoint>> {
        let inner = self.inner.lock().await;
        let mut latest: HashMap<&str, &OracleDataPoint> = HashMap::new();
        for point in inner.points.iter().filter(|p| p.feed_id == feed_id) {
            let newer = latest
                .get(point.source_id.as_str())
                .map_or(true, |current| point.timestamp > current.timestamp);
            if newer {
                latest.insert(point.source_id.as_str(), point);
            }
        }
        let mut points: Vec<OracleDataPoint> = latest.into_values().cloned().collect();
        points.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(points)
    }

    async fn source_reliability(&self, source_id: &str) -> EngineResult<Option<SourceReliability>> {
        Ok(self.inner.lock().await.reliability.get(source_id).cloned())
    }

    async fn upsert_source_reliability(&self, reliability: &SourceReliability) -> EngineResult<()> {
        self.inner
            .lock()
            .await
            .reliability
            .insert(reliability.source_id.clone(), reliability.clone());
        Ok(())
    }

    async fn insert_milestone(&self, milestone: &Milestone) -> EngineResult<()> {
        self.inner
            .lock()
            .await
            .milestones
            .insert(milestone.id, milestone.clone());
        Ok(())
    }

    async fn get_milestone(&self, id: Uuid) -> EngineResult<Option<Milestone>> {
        Ok(self.inner.lock().await.milestones.get(&id).cloned())
    }

    async fn claim_attempt(
        &self,
        attempt: &MilestoneVerificationAttempt,
    ) -> EngineResult<AttemptClaim> {
        let mut inner = self.inner.lock().await;
        let Some(milestone) = inner.milestones.get_mut(&attempt.milestone_id) else {
            return Ok(AttemptClaim::MilestoneMissing);
        };

        if milestone.release_state == ReleaseState::Confirmed {
            return Ok(AttemptClaim::AlreadyReleased);
        }
        match (milestone.verification_status, milestone.current_attempt_id) {
            (Some(status), _) if status.is_passing() => return Ok(AttemptClaim::AlreadyVerified),
            (Some(status), Some(current)) if status.is_open() => {
                return Ok(AttemptClaim::InProgress(current))
            }
            _ => {}
        }

        milestone.current_attempt_id = Some(attempt.id);
        milestone.verification_status = Some(attempt.status);
        inner.attempts.push(attempt.clone());
        Ok(AttemptClaim::Claimed)
    }

    async fn transition_attempt(
        &self,
        attempt: &MilestoneVerificationAttempt,
        from: VerificationStatus,
    ) -> EngineResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(stored) = inner.attempts.iter_mut().find(|a| a.id == attempt.id) else {
            return Err(EngineError::NotFound(format!("attempt {}", attempt.id)));
        };
        if stored.status != from {
            return Ok(false);
        }
        *stored = attempt.clone();

        if let Some(milestone) = inner.milestones.get_mut(&attempt.milestone_id) {
            if milestone.current_attempt_id == Some(attempt.id) {
                milestone.verification_status = Some(attempt.status);
            }
        }
        Ok(true)
    }

    async fn get_attempt(&self, id: Uuid) -> EngineResult<Option<MilestoneVerificationAttempt>> {
        Ok(self
            .inner
            .lock()
            .await
            .attempts
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn list_attempts(
        &self,
        milestone_id: Uuid,
    ) -> EngineResult<Vec<MilestoneVerificationAttempt>> {
        Ok(self
            .inner
            .lock()
            .await
            .attempts
            .iter()
            .rev()
            .filter(|a| a.milestone_id == milestone_id)
            .cloned()
            .collect())
    }

    async fn insert_allocation(&self, allocation: &FundAllocation) -> EngineResult<()> {
        self.inner.lock().await.allocations.push(allocation.clone());
        Ok(())
    }

    async fn get_allocation(&self, id: Uuid) -> EngineResult<Option<FundAllocation>> {
        Ok(self
            .inner
            .lock()
            .await
            .allocations
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn list_allocations(&self, milestone_id: Uuid) -> EngineResult<Vec<FundAllocation>> {
        Ok(self
            .inner
            .lock()
            .await
            .allocations
            .iter()
            .filter(|a| a.milestone_id == milestone_id)
            .cloned()
            .collect())
    }

    async fn add_approval(&self, approval: &Approval) -> EngineResult<bool> {
        let mut inner = self.inner.lock().await;
        let exists = inner.approvals.iter().any(|a| {
            a.allocation_id == approval.allocation_id && a.approver_id == approval.approver_id
        });
        if exists {
            return Ok(false);
        }
        inner.approvals.push(approval.clone());
        Ok(true)
    }

    async fn list_approvals(&self, allocation_id: Uuid) -> EngineResult<Vec<Approval>> {
        Ok(self
            .inner
            .lock()
            .await
            .approvals
            .iter()
            .filter(|a| a.allocation_id == allocation_id)
            .cloned()
            .collect())
    }

    async fn reserve_release(&self, milestone_id: Uuid) -> EngineResult<ReleaseReservation> {
        let mut inner = self.inner.lock().await;
        let Some(milestone) = inner.milestones.get_mut(&milestone_id) else {
            return Ok(ReleaseReservation::MilestoneMissing);
        };
        Ok(match milestone.release_state {
            ReleaseState::Open => {
                milestone.release_state = ReleaseState::Reserved;
                ReleaseReservation::Reserved
            }
            ReleaseState::Reserved => ReleaseReservation::AlreadyReserved,
            ReleaseState::Confirmed => ReleaseReservation::AlreadyConfirmed,
        })
    }

    async fn settle_release(&self, milestone_id: Uuid, confirmed: bool) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(milestone) = inner.milestones.get_mut(&milestone_id) {
            if milestone.release_state == ReleaseState::Reserved {
                milestone.release_state = if confirmed {
                    ReleaseState::Confirmed
                } else {
                    ReleaseState::Open
                };
            }
        }
        Ok(())
    }

    async fn insert_release(&self, release: &ReleaseTransaction) -> EngineResult<()> {
        self.inner.lock().await.releases.push(release.clone());
        Ok(())
    }

    async fn update_release(&self, release: &ReleaseTransaction) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .releases
            .iter_mut()
            .find(|r| r.id == release.id)
            .ok_or_else(|| EngineError::NotFound(format!("release {}", release.id)))?;
        *stored = release.clone();
        Ok(())
    }

    async fn get_release(&self, id: Uuid) -> EngineResult<Option<ReleaseTransaction>> {
        Ok(self
            .inner
            .lock()
            .await
            .releases
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn list_releases(&self, milestone_id: Uuid) -> EngineResult<Vec<ReleaseTransaction>> {
        Ok(self
            .inner
            .lock()
            .await
            .releases
            .iter()
            .rev()
            .filter(|r| r.milestone_id == milestone_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct AuditLog {
    entries: Vec<AuditEntry>,
    next_sequence: i64,
}

#[derive(Default)]
pub struct MemoryAuditSink {
    log: Mutex<AuditLog>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, entry: NewAuditEntry) -> EngineResult<AuditEntry> {
        let mut log = self.log.lock().await;
        log.next_sequence += 1;
        let entry = entry.into_entry(log.next_sequence);
        log.entries.push(entry.clone());
        Ok(entry)
    }

    async fn query(&self, filter: &AuditQuery) -> EngineResult<Vec<AuditEntry>> {
        let log = self.log.lock().await;
        let mut entries: Vec<AuditEntry> = log
            .entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.sequence.cmp(&a.sequence))
        });
        if let Some(limit) = filter.limit.filter(|limit| *limit > 0) {
            entries.truncate(limit as usize);
        }
        Ok(entries)
    }

    async fn durations(
        &self,
        operation: Option<OperationKind>,
    ) -> EngineResult<Vec<(OperationKind, i64)>> {
        let log = self.log.lock().await;
        Ok(log
            .entries
            .iter()
            .filter_map(|entry| Some((entry.operation?, entry.duration_ms?)))
            .filter(|(op, _)| operation.map_or(true, |wanted| *op == wanted))
            .collect())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> EngineResult<u64> {
        let mut log = self.log.lock().await;
        let before = log.entries.len();
        log.entries.retain(|entry| entry.created_at >= cutoff);
        Ok((before - log.entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuditEventKind, MetricTarget, FeedType};
    use std::sync::Arc;

    fn milestone() -> Milestone {
        Milestone {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            index: 0,
            title: "Inverter online".into(),
            targets: vec![MetricTarget {
                feed_type: FeedType::EnergyProduction,
                target_value: 90.0,
            }],
            due_date: None,
            current_attempt_id: None,
            verification_status: None,
            release_state: ReleaseState::Open,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_claim_sees_open_attempt() {
        let store = MemoryStore::new();
        let m = milestone();
        store.insert_milestone(&m).await.unwrap();

        let first = MilestoneVerificationAttempt::new(m.id, "alice", vec![]);
        assert_eq!(store.claim_attempt(&first).await.unwrap(), AttemptClaim::Claimed);

        let second = MilestoneVerificationAttempt::new(m.id, "bob", vec![]);
        assert_eq!(
            store.claim_attempt(&second).await.unwrap(),
            AttemptClaim::InProgress(first.id)
        );
    }

    #[tokio::test]
    async fn stale_transition_is_refused() {
        let store = MemoryStore::new();
        let m = milestone();
        store.insert_milestone(&m).await.unwrap();
        let mut attempt = MilestoneVerificationAttempt::new(m.id, "alice", vec![]);
        store.claim_attempt(&attempt).await.unwrap();

        attempt.status = VerificationStatus::InProgress;
        assert!(store
            .transition_attempt(&attempt, VerificationStatus::Pending)
            .await
            .unwrap());
        attempt.status = VerificationStatus::Verified;
        assert!(!store
            .transition_attempt(&attempt, VerificationStatus::Pending)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn only_one_concurrent_reservation_wins() {
        let store = Arc::new(MemoryStore::new());
        let m = milestone();
        store.insert_milestone(&m).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.reserve_release(m.id).await.unwrap() })
            })
            .collect();

        let mut reserved = 0;
        for handle in handles {
            if handle.await.unwrap() == ReleaseReservation::Reserved {
                reserved += 1;
            }
        }
        assert_eq!(reserved, 1);

        store.settle_release(m.id, true).await.unwrap();
        assert_eq!(
            store.reserve_release(m.id).await.unwrap(),
            ReleaseReservation::AlreadyConfirmed
        );
    }

    #[tokio::test]
    async fn latest_point_per_source_wins() {
        let store = MemoryStore::new();
        let feed_id = Uuid::new_v4();
        for (source, ts, value) in [("a", 10, 1.0), ("a", 20, 2.0), ("b", 15, 3.0)] {
            let point = OracleDataPoint {
                id: Uuid::new_v4(),
                feed_id,
                source_id: source.into(),
                value,
                confidence: 0.9,
                timestamp: ts,
                signature: None,
                received_at: Utc::now(),
            };
            assert!(store.insert_data_point(&point).await.unwrap());
            assert!(!store.insert_data_point(&point).await.unwrap());
        }
        let latest = store.latest_points_per_source(feed_id).await.unwrap();
        let values: Vec<f64> = latest.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![2.0, 3.0]);
    }

    #[tokio::test]
    async fn audit_sequence_orders_same_instant_entries() {
        let sink = MemoryAuditSink::new();
        let at = Utc::now();
        for detail in ["first", "second", "third"] {
            let mut entry = NewAuditEntry::new(AuditEventKind::ReleaseDecision, "system", detail);
            entry.created_at = at;
            sink.append(entry).await.unwrap();
        }
        let entries = sink.query(&AuditQuery::default()).await.unwrap();
        let details: Vec<&str> = entries.iter().map(|e| e.detail.as_str()).collect();
        assert_eq!(details, vec!["third", "second", "first"]);
    }
}
