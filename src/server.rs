use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{delete, get, post};
use axum::Router;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tokio::sync::watch;
use tracing::info;

use crate::auth::{AuthIdentity, TrustBoundary};
use crate::beads::SyncEngine;
use crate::config::BeadhiveConfig;
use crate::db::Database;
use crate::error::ApiError;
use crate::events::EventBus;
use crate::identity::IdentityAccess;
use crate::outbox::Sweeper;
use crate::presence::PresenceCache;
use crate::routes;
use crate::shutdown::ShutdownCoordinator;
use crate::workspaces::Bootstrap;

pub type IpRateLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub identity: Arc<dyn IdentityAccess>,
    pub trust: TrustBoundary,
    pub presence: PresenceCache,
    pub bus: EventBus,
    pub engine: SyncEngine,
    pub bootstrap: Bootstrap,
    pub config: Arc<BeadhiveConfig>,
    pub init_limiter: Arc<IpRateLimiter>,
}

impl AppState {
    pub fn new(
        config: BeadhiveConfig,
        db: Database,
        identity: Arc<dyn IdentityAccess>,
    ) -> Self {
        let bus = EventBus::new();
        let presence = PresenceCache::new(&config.presence, bus.clone());
        let trust = TrustBoundary::new(
            db.clone(),
            identity.clone(),
            config.auth.proxy_shared_secret.clone(),
        );
        let engine = SyncEngine::new(db.clone(), bus.clone());
        let bootstrap = Bootstrap::new(db.clone(), identity.clone());

        let burst = NonZeroU32::new(config.server.init_rate_limit.max(1))
            .unwrap_or(NonZeroU32::MIN);
        let period = Duration::from_secs(config.server.init_rate_window_seconds.max(1))
            / config.server.init_rate_limit.max(1);
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_minute(burst))
            .allow_burst(burst);

        Self {
            db,
            identity,
            trust,
            presence,
            bus,
            engine,
            bootstrap,
            config: Arc::new(config),
            init_limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }
}

/// Axum extractor: resolve the request through the trust boundary.
pub struct Authenticated(pub AuthIdentity);

#[async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let identity = state
            .trust
            .authenticate(parts.method.as_str(), parts.uri.path(), &parts.headers)
            .await?;
        Ok(Authenticated(identity))
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::status::health))
        .route("/v1/init", post(routes::init::init))
        .route("/v1/bdh/sync", post(routes::bdh::sync))
        .route("/v1/bdh/command", post(routes::bdh::command))
        .route("/v1/claims", get(routes::bdh::claims))
        .route(
            "/v1/policies",
            get(routes::policies::list).post(routes::policies::create),
        )
        .route("/v1/policies/active", get(routes::policies::active))
        .route("/v1/policies/:policy_id", get(routes::policies::show))
        .route("/v1/status", get(routes::status::snapshot))
        .route("/v1/status/stream", get(routes::status::stream))
        .route(
            "/v1/escalations",
            get(routes::escalations::list).post(routes::escalations::create),
        )
        .route(
            "/v1/escalations/:escalation_id",
            get(routes::escalations::show),
        )
        .route(
            "/v1/escalations/:escalation_id/respond",
            post(routes::escalations::respond),
        )
        .route(
            "/v1/subscriptions",
            get(routes::subscriptions::list).post(routes::subscriptions::create),
        )
        .route(
            "/v1/subscriptions/:subscription_id",
            delete(routes::subscriptions::remove),
        )
        .route(
            "/v1/workspaces/register",
            post(routes::workspaces::register),
        )
        .route(
            "/v1/workspaces/:workspace_id",
            delete(routes::workspaces::remove),
        )
        .with_state(state)
}

/// Run the server until a shutdown signal arrives.
pub async fn serve(config: BeadhiveConfig, db: Database, identity: Arc<dyn IdentityAccess>) -> Result<()> {
    let state = AppState::new(config, db, identity);

    let shutdown = ShutdownCoordinator::new();
    shutdown.install_signal_handlers();
    let sweeper = Sweeper {
        db: state.db.clone(),
        identity: state.identity.clone(),
        bus: state.bus.clone(),
        config: state.config.outbox.clone(),
    };
    let sweeper_handle = sweeper.spawn(shutdown.subscribe());

    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    )
    .parse()?;
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    info!(%addr, host = %server_host, "beadhive listening");

    let shutdown_rx = shutdown.subscribe();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_stop(shutdown_rx))
    .await?;

    shutdown.trigger();
    let _ = sweeper_handle.await;
    state.db.close().await;
    info!("beadhive stopped");
    Ok(())
}

async fn wait_for_stop(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
