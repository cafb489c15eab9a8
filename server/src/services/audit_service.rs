//! Audit trail recording, querying and retention

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    AuditEntry, AuditEventKind, AuditOutcome, AuditQuery, AuditSummary, KindCount,
    NewAuditEntry, OperationKind, PerformanceStats,
};
use crate::store::AuditSink;

pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
    retention_days: i64,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>, config: &AuditConfig) -> Self {
        Self {
            sink,
            retention_days: config.retention_days,
        }
    }

    pub async fn record(&self, entry: NewAuditEntry) -> EngineResult<AuditEntry> {
        let kind = entry.kind;
        self.sink.append(entry).await.map_err(|err| {
            error!(?kind, error = %err, "failed to append audit entry");
            err
        })
    }

    /// For paths that must not fail because the audit sink did, such as background tasks.
    pub async fn record_or_warn(&self, entry: NewAuditEntry) {
        let kind = entry.kind;
        if let Err(err) = self.sink.append(entry).await {
            warn!(?kind, error = %err, "audit entry dropped");
        }
    }

    /// Time-descending history of one milestone.
    pub async fn trail(
        &self,
        milestone_id: Uuid,
        limit: Option<i64>,
    ) -> EngineResult<Vec<AuditEntry>> {
        let mut filter = AuditQuery::for_milestone(milestone_id);
        filter.limit = limit;
        self.sink.query(&filter).await
    }

    pub async fn query(&self, filter: &AuditQuery) -> EngineResult<Vec<AuditEntry>> {
        self.sink.query(filter).await
    }

    /// Nearest-rank p50/p95/p99 per operation kind.
    pub async fn performance_stats(
        &self,
        operation: Option<OperationKind>,
    ) -> EngineResult<Vec<PerformanceStats>> {
        let mut samples: HashMap<OperationKind, Vec<i64>> = HashMap::new();
        for (op, duration_ms) in self.sink.durations(operation).await? {
            samples.entry(op).or_default().push(duration_ms);
        }

        let operations: Vec<OperationKind> = match operation {
            Some(op) => vec![op],
            None => OperationKind::ALL
                .into_iter()
                .filter(|op| samples.contains_key(op))
                .collect(),
        };

        Ok(operations
            .into_iter()
            .map(|op| {
                let mut values = samples.remove(&op).unwrap_or_default();
                values.sort_unstable();
                PerformanceStats {
                    operation: op,
                    p50: percentile(&values, 50.0),
                    p95: percentile(&values, 95.0),
                    p99: percentile(&values, 99.0),
                    sample_count: values.len(),
                }
            })
            .collect())
    }

    pub async fn summary(&self, filter: &AuditQuery) -> EngineResult<AuditSummary> {
        let mut unbounded = filter.clone();
        unbounded.limit = None;
        let entries = self.sink.query(&unbounded).await?;
        Ok(summarize(&entries))
    }

    /// Delete entries older than the retention window.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        let cutoff = now - Duration::days(self.retention_days);
        let removed = self.sink.prune_before(cutoff).await?;
        info!(removed, %cutoff, "pruned expired audit entries");
        Ok(removed)
    }

    /// Run `prune_expired` on a cron schedule.
    pub async fn schedule_retention(
        self: Arc<Self>,
        schedule: &str,
    ) -> anyhow::Result<JobScheduler> {
        let scheduler = JobScheduler::new().await?;
        let logger = self;
        let job = Job::new_async(schedule, move |_id, _scheduler| {
            let logger = logger.clone();
            Box::pin(async move {
                if let Err(err) = logger.prune_expired(Utc::now()).await {
                    error!(error = %err, "audit retention job failed");
                }
            })
        })?;
        scheduler.add(job).await?;
        scheduler.start().await?;
        Ok(scheduler)
    }
}

/// Audit kind recorded when a reading is refused.
pub fn rejection_kind(err: &EngineError) -> AuditEventKind {
    match err {
        EngineError::InvalidSignature { .. } => AuditEventKind::SignatureRejected,
        EngineError::StaleData { .. } | EngineError::FutureData { .. } => {
            AuditEventKind::StaleDataRejected
        }
        _ => AuditEventKind::DataPointRejected,
    }
}

/// Milliseconds since `started`, for `NewAuditEntry::timed`.
pub fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Nearest-rank percentile of an ascending slice; 0 when empty.
pub fn percentile(sorted: &[i64], p: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn summarize(entries: &[AuditEntry]) -> AuditSummary {
    let total = entries.len();
    let successes = entries
        .iter()
        .filter(|e| e.outcome == AuditOutcome::Success)
        .count();

    let durations: Vec<i64> = entries.iter().filter_map(|e| e.duration_ms).collect();
    let average_duration_ms = if durations.is_empty() {
        None
    } else {
        Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
    };

    let mut counts: BTreeMap<AuditEventKind, usize> = BTreeMap::new();
    for entry in entries {
        *counts.entry(entry.kind).or_default() += 1;
    }
    let mut by_kind: Vec<KindCount> = counts
        .into_iter()
        .map(|(kind, count)| KindCount { kind, count })
        .collect();
    by_kind.sort_by(|a, b| b.count.cmp(&a.count));

    AuditSummary {
        total,
        successes,
        failures: total - successes,
        success_rate: if total == 0 {
            0.0
        } else {
            successes as f64 / total as f64
        },
        average_duration_ms,
        by_kind,
    }
}
