use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::auth::Actor;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    AttestationRequest, AuditEventKind, CreateFeedRequest, DataPointReceipt, NewAuditEntry,
    OracleDataPoint, OracleFeed, SubmitDataPointRequest,
};
use crate::oracle::signature::{Attestation, MultiSignatureResult, SignatureVerifier};
use crate::oracle::PointFilter;
use crate::services::audit_service::{rejection_kind, AuditLogger};
use crate::store::EngineStore;

/// Feed subscriptions and data point ingestion
pub struct OracleService {
    store: Arc<dyn EngineStore>,
    audit: Arc<AuditLogger>,
    filter: PointFilter,
}

impl OracleService {
    pub fn new(store: Arc<dyn EngineStore>, audit: Arc<AuditLogger>, filter: PointFilter) -> Self {
        Self {
            store,
            audit,
            filter,
        }
    }

    pub async fn subscribe_feed(
        &self,
        request: CreateFeedRequest,
        actor: &Actor,
    ) -> EngineResult<OracleFeed> {
        request.validate()?;

        let mut seen = HashSet::new();
        for source in &request.sources {
            source.validate()?;
            if !seen.insert(source.source_id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "source {} listed twice",
                    source.source_id
                )));
            }
            SignatureVerifier::decode_public_key(&source.public_key).map_err(|reason| {
                EngineError::Validation(format!("source {}: {}", source.source_id, reason))
            })?;
        }

        let feed = OracleFeed {
            id: Uuid::new_v4(),
            project_id: request.project_id,
            address: request.address,
            feed_type: request.feed_type,
            update_interval_secs: request.update_interval_secs,
            max_staleness_secs: request.max_staleness_secs,
            min_confidence: request.min_confidence,
            endpoint_url: request.endpoint_url,
            sources: request.sources,
            is_active: true,
            created_at: Utc::now(),
            deactivated_at: None,
        };
        self.store.insert_feed(&feed).await?;

        self.audit
            .record(NewAuditEntry::new(
                AuditEventKind::FeedSubscribed,
                actor.id.as_str(),
                format!(
                    "feed {} ({}) subscribed for project {} with {} sources",
                    feed.id,
                    feed.feed_type,
                    feed.project_id,
                    feed.sources.len()
                ),
            ))
            .await?;
        info!(feed_id = %feed.id, project_id = %feed.project_id, feed_type = %feed.feed_type, "feed subscribed");

        Ok(feed)
    }

    /// Feeds are never deleted; deactivation excludes them from verification and polling.
    pub async fn deactivate_feed(&self, feed_id: Uuid, actor: &Actor) -> EngineResult<OracleFeed> {
        let changed = self.store.deactivate_feed(feed_id, Utc::now()).await?;
        let feed = self
            .store
            .get_feed(feed_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("feed {}", feed_id)))?;

        if changed {
            self.audit
                .record(NewAuditEntry::new(
                    AuditEventKind::FeedDeactivated,
                    actor.id.as_str(),
                    format!("feed {} deactivated", feed_id),
                ))
                .await?;
            info!(%feed_id, "feed deactivated");
        }
        Ok(feed)
    }

    pub async fn list_feeds(
        &self,
        project_id: Uuid,
        include_inactive: bool,
    ) -> EngineResult<Vec<OracleFeed>> {
        self.store.list_feeds(Some(project_id), !include_inactive).await
    }

    pub async fn active_feeds(&self) -> EngineResult<Vec<OracleFeed>> {
        self.store.list_feeds(None, true).await
    }

    /// Validate and store one reading. Rejections are audited before they are returned.
    pub async fn ingest_data_point(
        &self,
        feed_id: Uuid,
        request: SubmitDataPointRequest,
        actor: &Actor,
    ) -> EngineResult<DataPointReceipt> {
        request.validate()?;
        if !request.value.is_finite() {
            return Err(EngineError::Validation("value must be a finite number".into()));
        }

        let feed = self
            .store
            .get_feed(feed_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("feed {}", feed_id)))?;
        if !feed.is_active {
            return Err(EngineError::Validation(format!("feed {} is inactive", feed_id)));
        }

        if let Err(err) = self.filter.check_authenticity(
            &feed,
            &request.source_id,
            request.timestamp,
            request.value,
            request.signature.as_deref(),
            Utc::now().timestamp(),
        ) {
            warn!(%feed_id, source_id = %request.source_id, error = %err, "data point rejected");
            self.audit
                .record(
                    NewAuditEntry::new(
                        rejection_kind(&err),
                        actor.id.as_str(),
                        format!("feed {} source {}: {}", feed_id, request.source_id, err),
                    )
                    .failed()
                    .status(err.kind()),
                )
                .await?;
            return Err(err);
        }

        let point = OracleDataPoint {
            id: Uuid::new_v4(),
            feed_id,
            source_id: request.source_id,
            value: request.value,
            confidence: request.confidence,
            timestamp: request.timestamp,
            signature: request.signature,
            received_at: Utc::now(),
        };
        let inserted = self.store.insert_data_point(&point).await?;
        if !inserted {
            debug!(%feed_id, source_id = %point.source_id, timestamp = point.timestamp, "duplicate data point ignored");
        }

        Ok(DataPointReceipt {
            point_id: point.id,
            feed_id,
            source_id: point.source_id,
            duplicate: !inserted,
        })
    }

    /// Check a reading jointly signed by several of the feed's sources.
    pub async fn verify_attestation(
        &self,
        feed_id: Uuid,
        request: AttestationRequest,
        actor: &Actor,
    ) -> EngineResult<MultiSignatureResult> {
        request.validate()?;
        for signature in &request.signatures {
            signature.validate()?;
        }

        let feed = self
            .store
            .get_feed(feed_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("feed {}", feed_id)))?;

        let attestations = request
            .signatures
            .into_iter()
            .map(|signed| {
                let source = feed.source(&signed.source_id).ok_or_else(|| {
                    EngineError::Unauthorized(format!(
                        "source {} is not registered on feed {}",
                        signed.source_id, feed_id
                    ))
                })?;
                Ok(Attestation {
                    source_id: signed.source_id,
                    public_key: source.public_key.clone(),
                    signature: signed.signature,
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let payload = SignatureVerifier::attestation_payload(feed_id, request.timestamp, request.value);
        let result =
            SignatureVerifier::verify_attestations(&payload, &attestations, request.required_consensus);

        if !result.consensus_met {
            self.audit
                .record(
                    NewAuditEntry::new(
                        AuditEventKind::SignatureRejected,
                        actor.id.as_str(),
                        format!(
                            "attestation on feed {}: {} of {} valid, {} required",
                            feed_id, result.valid_count, result.total_count, result.required
                        ),
                    )
                    .failed(),
                )
                .await?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ActorRole;
    use crate::config::{AuditConfig, ConfidencePolicy, SignaturePolicy, TimestampPolicy};
    use crate::models::{AuditQuery, FeedSource, FeedType, SourceSignature};
    use crate::store::{MemoryAuditSink, MemoryStore};
    use ed25519_dalek::{Signer, SigningKey};

    struct Fixture {
        service: OracleService,
        audit: Arc<AuditLogger>,
        key: SigningKey,
    }

    fn fixture() -> Fixture {
        let audit = Arc::new(AuditLogger::new(
            Arc::new(MemoryAuditSink::new()),
            &AuditConfig::default(),
        ));
        let filter = PointFilter::new(
            SignaturePolicy::default(),
            TimestampPolicy::default(),
            ConfidencePolicy::default(),
        );
        Fixture {
            service: OracleService::new(Arc::new(MemoryStore::new()), audit.clone(), filter),
            audit,
            key: SigningKey::from_bytes(&[21; 32]),
        }
    }

    fn operator() -> Actor {
        Actor::new("ops", ActorRole::Operator)
    }

    fn feed_request(key: &SigningKey) -> CreateFeedRequest {
        CreateFeedRequest {
            project_id: Uuid::new_v4(),
            address: "meter://site-1".into(),
            feed_type: FeedType::EnergyProduction,
            update_interval_secs: 60,
            max_staleness_secs: 300,
            min_confidence: 0.5,
            endpoint_url: None,
            sources: vec![FeedSource {
                source_id: "meter-a".into(),
                public_key: hex::encode(key.verifying_key().to_bytes()),
            }],
        }
    }

    fn signed(key: &SigningKey, timestamp: i64, value: f64) -> SubmitDataPointRequest {
        let payload = SignatureVerifier::signing_payload("meter-a", timestamp, value);
        SubmitDataPointRequest {
            source_id: "meter-a".into(),
            value,
            confidence: 0.9,
            timestamp,
            signature: Some(hex::encode(key.sign(&payload).to_bytes())),
        }
    }

    #[tokio::test]
    async fn ingests_and_deduplicates() {
        let f = fixture();
        let feed = f
            .service
            .subscribe_feed(feed_request(&f.key), &operator())
            .await
            .unwrap();
        let now = Utc::now().timestamp();

        let first = f
            .service
            .ingest_data_point(feed.id, signed(&f.key, now, 12.5), &operator())
            .await
            .unwrap();
        assert!(!first.duplicate);
        let again = f
            .service
            .ingest_data_point(feed.id, signed(&f.key, now, 12.5), &operator())
            .await
            .unwrap();
        assert!(again.duplicate);
    }

    #[tokio::test]
    async fn stale_point_is_rejected_and_audited() {
        let f = fixture();
        let feed = f
            .service
            .subscribe_feed(feed_request(&f.key), &operator())
            .await
            .unwrap();
        let twenty_minutes_ago = Utc::now().timestamp() - 1200;

        let err = f
            .service
            .ingest_data_point(feed.id, signed(&f.key, twenty_minutes_ago, 12.5), &operator())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "StaleData");

        let entries = f
            .audit
            .query(&AuditQuery {
                kind: Some(AuditEventKind::StaleDataRejected),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn deactivated_feed_refuses_points() {
        let f = fixture();
        let feed = f
            .service
            .subscribe_feed(feed_request(&f.key), &operator())
            .await
            .unwrap();
        let deactivated = f.service.deactivate_feed(feed.id, &operator()).await.unwrap();
        assert!(!deactivated.is_active);
        assert!(deactivated.deactivated_at.is_some());

        let err = f
            .service
            .ingest_data_point(feed.id, signed(&f.key, Utc::now().timestamp(), 1.0), &operator())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Validation");

        let listed = f.service.list_feeds(feed.project_id, false).await.unwrap();
        assert!(listed.is_empty());
        let all = f.service.list_feeds(feed.project_id, true).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn attestation_counts_valid_sources() {
        let f = fixture();
        let second = SigningKey::from_bytes(&[22; 32]);
        let mut request = feed_request(&f.key);
        request.sources.push(FeedSource {
            source_id: "meter-b".into(),
            public_key: hex::encode(second.verifying_key().to_bytes()),
        });
        let feed = f.service.subscribe_feed(request, &operator()).await.unwrap();

        let timestamp = Utc::now().timestamp();
        let payload = SignatureVerifier::attestation_payload(feed.id, timestamp, 42.0);
        let signatures = vec![
            SourceSignature {
                source_id: "meter-a".into(),
                signature: Some(hex::encode(f.key.sign(&payload).to_bytes())),
            },
            SourceSignature {
                source_id: "meter-b".into(),
                signature: Some(hex::encode(second.sign(b"something else").to_bytes())),
            },
        ];

        let result = f
            .service
            .verify_attestation(
                feed.id,
                AttestationRequest {
                    timestamp,
                    value: 42.0,
                    signatures,
                    required_consensus: Some(2),
                },
                &operator(),
            )
            .await
            .unwrap();
        assert_eq!(result.valid_count, 1);
        assert_eq!(result.total_count, 2);
        assert!(!result.consensus_met);

        let rejected = f
            .audit
            .query(&AuditQuery {
                kind: Some(AuditEventKind::SignatureRejected),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
    }

    #[tokio::test]
    async fn rejects_bad_public_keys() {
        let f = fixture();
        let mut request = feed_request(&f.key);
        request.sources[0].public_key = "z".repeat(64);
        let err = f
            .service
            .subscribe_feed(request, &operator())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Validation");
    }
}
