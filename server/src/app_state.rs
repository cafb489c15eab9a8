//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;

use crate::config::EngineConfig;
use crate::ledger::LedgerClient;
use crate::oracle::consensus::ConsensusEngine;
use crate::oracle::confidence::ConfidenceScorer;
use crate::oracle::PointFilter;
use crate::services::{AuditLogger, OracleService, ReleaseService, VerificationService};
use crate::store::{AuditSink, EngineStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub oracle_service: Arc<OracleService>,
    pub verification_service: Arc<VerificationService>,
    pub release_service: Arc<ReleaseService>,
    pub audit: Arc<AuditLogger>,
    pub config: Arc<EngineConfig>,
}

impl AppState {
    pub fn new(
        oracle_service: Arc<OracleService>,
        verification_service: Arc<VerificationService>,
        release_service: Arc<ReleaseService>,
        audit: Arc<AuditLogger>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            oracle_service,
            verification_service,
            release_service,
            audit,
            config,
        }
    }

    /// Wire every service from configuration and the chosen backends.
    pub fn build(
        config: EngineConfig,
        store: Arc<dyn EngineStore>,
        sink: Arc<dyn AuditSink>,
        ledger: Arc<dyn LedgerClient>,
    ) -> Self {
        let filter = || {
            PointFilter::new(
                config.signature.clone(),
                config.timestamp.clone(),
                config.confidence.clone(),
            )
        };
        let audit = Arc::new(AuditLogger::new(sink, &config.audit));

        let oracle_service = Arc::new(OracleService::new(store.clone(), audit.clone(), filter()));
        let release_service = Arc::new(ReleaseService::new(
            store.clone(),
            audit.clone(),
            ledger,
            config.release.clone(),
            config.ledger.clone(),
        ));
        let consensus = ConsensusEngine::new(
            config.consensus.clone(),
            ConfidenceScorer::new(config.confidence.clone()),
        );
        let verification_service = Arc::new(
            VerificationService::new(
                store,
                audit.clone(),
                filter(),
                consensus,
                config.verification.clone(),
            )
            .with_auto_release(release_service.clone()),
        );

        Self::new(
            oracle_service,
            verification_service,
            release_service,
            audit,
            Arc::new(config),
        )
    }
}

impl FromRef<AppState> for Arc<OracleService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.oracle_service.clone()
    }
}

impl FromRef<AppState> for Arc<VerificationService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.verification_service.clone()
    }
}

impl FromRef<AppState> for Arc<ReleaseService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.release_service.clone()
    }
}

impl FromRef<AppState> for Arc<AuditLogger> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.audit.clone()
    }
}
