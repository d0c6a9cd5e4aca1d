pub mod error;

use axum::{
    Json, Router,
    extract::State,
    http::HeaderValue,
    routing::{get, post},
};
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::market_data::types::QuoteRecord;
use crate::refresh::coordinator::{Phase, RefreshCoordinator, Trigger};
use crate::state::query::QuoteQuery;
use error::ApiResult;

#[derive(Clone)]
pub struct AppState {
    pub query: QuoteQuery,
    pub coordinator: RefreshCoordinator,
    pub refresh_interval: Duration,
}

impl AppState {
    pub fn new(coordinator: RefreshCoordinator, refresh_interval: Duration) -> Self {
        Self {
            query: QuoteQuery::new(coordinator.clone()),
            coordinator,
            refresh_interval,
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub phase: Phase,
    pub generation: u64,
    pub quotes: usize,
    /// Unix seconds of the last successful fetch.
    pub fetched_at: Option<u64>,
    pub age_secs: Option<u64>,
    pub stale: bool,
}

/// Current snapshot; fetches first when nothing has been cached yet.
async fn list_cryptocurrencies(State(state): State<AppState>) -> ApiResult<Json<Vec<QuoteRecord>>> {
    let snapshot = state.query.get_current().await?;
    Ok(Json(snapshot.quotes().to_vec()))
}

/// On-demand refresh. Joins a cycle that is already running.
async fn refresh_cryptocurrencies(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<QuoteRecord>>> {
    let snapshot = state.coordinator.refresh(Trigger::OnDemand).await?;
    Ok(Json(snapshot.quotes().to_vec()))
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthStatus>> {
    let snapshot = state.query.peek().await?;
    let age = snapshot.age(SystemTime::now());

    Ok(Json(HealthStatus {
        phase: state.coordinator.phase(),
        generation: snapshot.generation(),
        quotes: snapshot.quotes().len(),
        fetched_at: snapshot
            .fetched_at()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs()),
        age_secs: age.map(|d| d.as_secs()),
        stale: age.is_none_or(|a| a > state.refresh_interval * 2),
    }))
}

fn cors_layer(cors_allow: &[String]) -> CorsLayer {
    if cors_allow.is_empty() || cors_allow.iter().any(|o| o == "*") {
        return CorsLayer::new().allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = cors_allow
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new().allow_origin(origins)
}

pub fn app_router(state: AppState, cors_allow: &[String]) -> Router {
    let api = Router::new()
        .route("/cryptocurrencies", get(list_cryptocurrencies))
        .route("/cryptocurrencies/refresh", post(refresh_cryptocurrencies))
        .route("/health", get(health));

    Router::new()
        .nest("/api", api)
        .layer(cors_layer(cors_allow))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
