//! EmpowerGRID Verification Engine Server
//!
//! Ingests signed oracle readings, verifies project milestones against them,
//! and releases escrowed funds once a milestone passes.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{header, HeaderName, HeaderValue, Method};
use tokio::time::{sleep, Duration};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use empowergrid_server::app_state::AppState;
use empowergrid_server::auth::{ACTOR_ID_HEADER, ACTOR_ROLE_HEADER};
use empowergrid_server::config::{EngineConfig, ServerConfig};
use empowergrid_server::ledger::{LedgerClient, RpcLedgerClient, SimulatedLedger};
use empowergrid_server::oracle::poller::FeedPoller;
use empowergrid_server::routes::api_router;
use empowergrid_server::store::{
    AuditSink, EngineStore, MemoryAuditSink, MemoryStore, PgAuditSink, PgStore,
};

const POLLER_SUPERVISOR_MAX_BACKOFF_SECONDS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env();

    let (store, sink): (Arc<dyn EngineStore>, Arc<dyn AuditSink>) = match &config.database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            let store = PgStore::new(pool.clone());
            store.migrate().await.context("failed to run migrations")?;
            info!("using postgres store");
            (Arc::new(store), Arc::new(PgAuditSink::new(pool)))
        }
        None => {
            warn!("DATABASE_URL not set; state is kept in memory and lost on restart");
            (Arc::new(MemoryStore::new()), Arc::new(MemoryAuditSink::new()))
        }
    };

    let ledger: Arc<dyn LedgerClient> = match &config.ledger.rpc_url {
        Some(url) => Arc::new(
            RpcLedgerClient::new(
                url.clone(),
                Duration::from_millis(config.ledger.request_timeout_ms),
            )
            .context("failed to build ledger client")?,
        ),
        None => {
            warn!("LEDGER_RPC_URL not set; releases settle against the simulated ledger");
            Arc::new(SimulatedLedger::new())
        }
    };

    let server_config = config.server.clone();
    let poller_config = config.poller.clone();
    let prune_schedule = config.audit.prune_schedule.clone();
    let state = AppState::build(config, store, sink, ledger);

    let _retention = state
        .audit
        .clone()
        .schedule_retention(&prune_schedule)
        .await
        .context("failed to schedule audit retention")?;

    // Start and supervise the background feed poller.
    let oracle = state.oracle_service.clone();
    let audit = state.audit.clone();
    tokio::spawn(async move {
        let mut restart_count: u32 = 0;
        loop {
            let poller = match FeedPoller::new(oracle.clone(), audit.clone(), poller_config.clone()) {
                Ok(poller) => poller,
                Err(err) => {
                    error!(error = %err, "feed poller could not be built; giving up");
                    break;
                }
            };
            let handle = tokio::spawn(async move { poller.start().await });

            match handle.await {
                Ok(Ok(())) => {
                    info!("feed poller exited cleanly; stopping supervisor");
                    break;
                }
                Ok(Err(err)) => {
                    error!(error = %err, "feed poller failed; restarting");
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!("feed poller panicked; restarting");
                    } else {
                        error!(error = %join_error, "feed poller task failed; restarting");
                    }
                }
            }

            restart_count = restart_count.saturating_add(1);
            let backoff_seconds = (2u64.saturating_pow(restart_count.min(5)))
                .min(POLLER_SUPERVISOR_MAX_BACKOFF_SECONDS);
            warn!(restart_count, backoff_seconds, "feed poller restart backoff");
            sleep(Duration::from_secs(backoff_seconds)).await;
        }
    });

    let app = api_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(&server_config));

    let addr = SocketAddr::from(([0, 0, 0, 0], server_config.port));
    info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let allowed_origins = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(ACTOR_ID_HEADER),
            HeaderName::from_static(ACTOR_ROLE_HEADER),
        ])
        .allow_credentials(false)
}
