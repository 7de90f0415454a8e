//! HTTP surface for liveness/readiness probes and metrics scraping. The
//! worker's only inbound HTTP traffic — no business endpoints are served
//! here.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use sea_orm::{ConnectionTrait, Statement};
use serde_json::json;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::warn;

use crate::db::SeaOrmDbPool;
use crate::metrics::MetricsRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
}

pub struct HealthState {
    db: Arc<SeaOrmDbPool>,
    metrics: Arc<MetricsRegistry>,
    start_time: SystemTime,
    readiness: RwLock<Readiness>,
}

impl HealthState {
    pub fn new(db: Arc<SeaOrmDbPool>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            db,
            metrics,
            start_time: SystemTime::now(),
            readiness: RwLock::new(Readiness::Ready),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.start_time)
            .unwrap_or(Duration::from_secs(0))
            .as_secs()
    }

    pub async fn set_readiness(&self, readiness: Readiness) {
        *self.readiness.write().await = readiness;
    }

    async fn ping_db(&self) -> bool {
        self.db
            .execute("health_ping", |conn| async move {
                conn.execute(Statement::from_string(
                    conn.get_database_backend(),
                    "SELECT 1".to_string(),
                ))
                .await
            })
            .await
            .is_ok()
    }

    /// Pulls the live breaker/pool state into the Prometheus registry.
    /// Sample-on-scrape keeps these gauges current without a background
    /// polling task, since the `/metrics` route is itself the consumer.
    fn sample_gauges(&self) {
        self.metrics.gauge("breaker_state").set(self.db.breaker_state_gauge() as f64);
        let pool_gauges = self.db.pool_gauges();
        self.metrics.gauge("db_pool_active").set(pool_gauges.active_connections as f64);
        self.metrics.gauge("db_pool_idle").set(pool_gauges.idle_connections as f64);
        self.metrics.gauge("db_pool_queued").set(pool_gauges.queued_acquires as f64);
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let declared_ready = *state.readiness.read().await == Readiness::Ready;
    if !declared_ready {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"ready": false}))).into_response();
    }

    if state.ping_db().await {
        (StatusCode::OK, Json(json!({"ready": true}))).into_response()
    } else {
        warn!("readiness probe failed: database unreachable");
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"ready": false}))).into_response()
    }
}

async fn healthz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    Json(json!({
        "status": "up",
        "uptime_seconds": state.uptime_seconds(),
        "breaker_state": state.db.breaker_state_gauge(),
    }))
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    state.sample_gauges();
    state.metrics.export_prometheus()
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(5))),
        )
        .with_state(state)
}
