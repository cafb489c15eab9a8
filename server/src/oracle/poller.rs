//! Background ingestion for feeds that expose a pull endpoint.
//!
//! Each active feed with an `endpoint_url` is fetched every
//! `update_interval_secs`. Failing feeds back off exponentially, capped at
//! `max_backoff_secs`, without holding up the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::Actor;
use crate::config::PollerConfig;
use crate::models::{AuditEventKind, NewAuditEntry, OperationKind, OracleFeed, SubmitDataPointRequest};
use crate::services::audit_service::{elapsed_ms, AuditLogger};
use crate::services::oracle_service::OracleService;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedPayload {
    Batch(Vec<SubmitDataPointRequest>),
    Single(SubmitDataPointRequest),
}

impl FeedPayload {
    fn into_points(self) -> Vec<SubmitDataPointRequest> {
        match self {
            FeedPayload::Batch(points) => points,
            FeedPayload::Single(point) => vec![point],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FeedSchedule {
    next_due: Instant,
    consecutive_failures: u32,
}

#[derive(Clone)]
pub struct FeedPoller {
    oracle: Arc<OracleService>,
    audit: Arc<AuditLogger>,
    config: PollerConfig,
    http: Client,
    schedules: Arc<Mutex<HashMap<Uuid, FeedSchedule>>>,
}

impl FeedPoller {
    pub fn new(
        oracle: Arc<OracleService>,
        audit: Arc<AuditLogger>,
        config: PollerConfig,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            oracle,
            audit,
            config,
            http,
            schedules: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Runs until the task is dropped. Returns immediately when polling is disabled.
    pub async fn start(self) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!("feed poller disabled");
            return Ok(());
        }

        info!(tick_secs = self.config.tick_secs, "feed poller started");
        loop {
            if let Err(err) = self.poll_once().await {
                error!(error = %err, "feed poll cycle failed");
            }
            sleep(Duration::from_secs(self.config.tick_secs.max(1))).await;
        }
    }

    /// Fetch every feed that is due, up to `max_concurrent_feeds` at a time.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let feeds = self.oracle.active_feeds().await?;
        let now = Instant::now();

        let due: Vec<OracleFeed> = {
            let mut schedules = self.schedules.lock().await;
            let live: Vec<Uuid> = feeds.iter().map(|feed| feed.id).collect();
            schedules.retain(|id, _| live.contains(id));

            feeds
                .into_iter()
                .filter(|feed| feed.endpoint_url.is_some())
                .filter(|feed| {
                    schedules
                        .get(&feed.id)
                        .map_or(true, |schedule| schedule.next_due <= now)
                })
                .collect()
        };

        let polled = due.len();
        stream::iter(due)
            .for_each_concurrent(self.config.max_concurrent_feeds.max(1), |feed| async move {
                self.poll_feed(&feed).await;
            })
            .await;

        if polled > 0 {
            debug!(polled, "feed poll cycle complete");
        }
        Ok(polled)
    }

    async fn poll_feed(&self, feed: &OracleFeed) {
        let started = Instant::now();
        let result = self.fetch_and_ingest(feed).await;
        let duration_ms = elapsed_ms(started);

        let mut schedules = self.schedules.lock().await;
        let schedule = schedules.entry(feed.id).or_insert(FeedSchedule {
            next_due: Instant::now(),
            consecutive_failures: 0,
        });

        match result {
            Ok(accepted) => {
                schedule.consecutive_failures = 0;
                schedule.next_due =
                    Instant::now() + Duration::from_secs(feed.update_interval_secs.max(1) as u64);
                debug!(feed_id = %feed.id, accepted, duration_ms, "feed polled");
            }
            Err(err) => {
                schedule.consecutive_failures = schedule.consecutive_failures.saturating_add(1);
                let backoff_secs = poll_backoff_secs(
                    feed.update_interval_secs.max(1) as u64,
                    schedule.consecutive_failures,
                    self.config.max_backoff_secs,
                );
                schedule.next_due = Instant::now() + Duration::from_secs(backoff_secs);
                warn!(
                    feed_id = %feed.id,
                    failures = schedule.consecutive_failures,
                    backoff_secs,
                    error = %err,
                    "feed poll failed"
                );
                drop(schedules);

                self.audit
                    .record_or_warn(
                        NewAuditEntry::new(
                            AuditEventKind::DataPointRejected,
                            Actor::system().id,
                            format!("poll of feed {} failed: {}", feed.id, err),
                        )
                        .failed()
                        .timed(OperationKind::FeedPoll, duration_ms),
                    )
                    .await;
            }
        }
    }

    async fn fetch_and_ingest(&self, feed: &OracleFeed) -> anyhow::Result<usize> {
        let url = feed
            .endpoint_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("feed {} has no endpoint", feed.id))?;

        let payload = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<FeedPayload>()
            .await?;

        let system = Actor::system();
        let mut accepted = 0;
        for point in payload.into_points() {
            // Rejections are audited by the ingestion path; one bad reading does not fail the poll.
            match self.oracle.ingest_data_point(feed.id, point, &system).await {
                Ok(receipt) if !receipt.duplicate => accepted += 1,
                Ok(_) => {}
                Err(err) if err.status_code().is_client_error() => {
                    debug!(feed_id = %feed.id, error = %err, "polled data point refused");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(accepted)
    }
}

/// `interval * 2^failures`, capped.
pub fn poll_backoff_secs(interval_secs: u64, failures: u32, max_backoff_secs: u64) -> u64 {
    interval_secs
        .saturating_mul(2u64.saturating_pow(failures.min(16)))
        .min(max_backoff_secs.max(interval_secs))
}
