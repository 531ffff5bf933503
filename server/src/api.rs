//! Read-only HTTP API over the mirror store.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use ci_mirror_runtime::{MirrorRecord, MirrorStore};

#[derive(Debug, Default, Deserialize)]
pub struct MirrorsQuery {
    pub action: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShowResponse {
    pub mirrors: Vec<MirrorRecord>,
    pub total: u64,
}

/// Build the API router.
pub fn router(store: Arc<MirrorStore>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/v1/mirrors", get(mirrors))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn mirrors(
    State(store): State<Arc<MirrorStore>>,
    Query(query): Query<MirrorsQuery>,
) -> Response {
    let action = query
        .action
        .as_deref()
        .filter(|action| !action.is_empty())
        .unwrap_or("summarize");
    let limit = query
        .limit
        .as_deref()
        .filter(|limit| !limit.is_empty())
        .unwrap_or("1");

    let limit: i64 = match limit.trim().parse() {
        Ok(limit) => limit,
        Err(e) => {
            tracing::debug!(limit, error = %e, "Rejecting mirrors request");
            return internal_error(format!("invalid limit '{}': {}", limit, e));
        }
    };

    match action {
        "show" => match store.show(limit) {
            Ok((mirrors, total)) => Json(ShowResponse { mirrors, total }).into_response(),
            Err(e) => internal_error(e.to_string()),
        },
        "summarize" => Json(store.summarize()).into_response(),
        other => internal_error(format!("invalid action: {}", other)),
    }
}

fn internal_error(message: String) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}
