// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Read-only observability surface under `/api/v1/`. The engine exposes no
// control endpoints: configuration changes go through the config file and a
// restart. CORS is permissive for local dashboards.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

/// Build the REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/universe", get(universe))
        .route("/api/v1/decisions", get(decisions))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "session_id": state.journal.session_id(),
        "server_time": crate::types::now_ms(),
        "journal_impaired": state.journal.is_impaired(),
    }))
}

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn universe(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.subscription_records())
}

#[derive(Debug, Deserialize)]
struct DecisionsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Tail of the decision journal, parsed per line. The journal file is the
/// store of record; this endpoint is a convenience view over its tail.
async fn decisions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DecisionsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.min(1_000);
    let path = state.cfg.journal.file_path.clone();

    let lines = tokio::task::spawn_blocking(move || -> Vec<serde_json::Value> {
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        let all: Vec<&str> = content.lines().collect();
        let skip = all.len().saturating_sub(limit);
        all.into_iter()
            .skip(skip)
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    })
    .await
    .unwrap_or_default();

    Json(lines)
}
