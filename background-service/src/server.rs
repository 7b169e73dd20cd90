//! Read-only HTTP surface over the daemon's health and recent insights.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use insightwatch_core::{CoreError, HealthRecord, Insight, InsightStore};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::health::HealthReporter;
use crate::supervisor::{SupervisorHandle, SupervisorState};

const DEFAULT_RECENT_LIMIT: usize = 10;
const MAX_RECENT_LIMIT: usize = 100;

#[derive(Clone)]
pub struct ApiState {
    pub health: Arc<RwLock<HealthReporter>>,
    pub supervisor: SupervisorHandle,
    pub store: Arc<dyn InsightStore>,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub record: HealthRecord,
    pub supervisor: SupervisorState,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InsightsResponse {
    pub insights: Vec<Insight>,
    pub count: usize,
    pub total: u64,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    limit: Option<usize>,
}

pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/insights", get(recent_insights))
        .route("/api/insights/recent", get(recent_insights))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

pub async fn bind(port: u16) -> Result<TcpListener, CoreError> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Health API listening on port {}", port);
    Ok(listener)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: ApiState, shutdown: F) -> Result<(), CoreError>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let record = state.health.read().await.current(Utc::now());
    Json(HealthResponse {
        record,
        supervisor: state.supervisor.state(),
        port: state.port,
    })
}

async fn recent_insights(
    State(state): State<ApiState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<InsightsResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT);

    let insights = state.store.recent_insights(limit).await?;
    let total = state.store.insight_count().await?;
    Ok(Json(InsightsResponse {
        count: insights.len(),
        insights,
        total,
    }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Endpoint not found" })),
    )
}

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        warn!("Health API request failed: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}
