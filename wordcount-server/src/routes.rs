use crate::query::run_word_count;
use crate::render::{self, ErrorPage, NoResultsPage, ResultsPage, UnavailablePage};
use crate::state::{AppState, ClientHandle};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.client {
        ClientHandle::Ready(_) => {
            debug!("Health check: healthy");
            (
                StatusCode::OK,
                Json(json!({ "status": "healthy", "word": state.config.word })),
            )
                .into_response()
        }
        ClientHandle::Unavailable(cause) => {
            warn!("Health check: unhealthy ({})", cause);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "reason": format!("BigQuery client not initialized: {}", cause),
                })),
            )
                .into_response()
        }
    }
}

pub async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let warehouse = match state.warehouse() {
        Some(w) => w,
        None => {
            return render::template_response(StatusCode::SERVICE_UNAVAILABLE, UnavailablePage)
        }
    };

    let cfg = &state.config;
    let result =
        run_word_count(warehouse, &cfg.bigquery.table, &cfg.word, cfg.query_timeout()).await;
    match result {
        Ok(rows) if rows.is_empty() => {
            render::template_response(StatusCode::OK, NoResultsPage { word: &cfg.word })
        }
        Ok(rows) => {
            render::template_response(StatusCode::OK, ResultsPage::new(&cfg.word, &rows))
        }
        Err(e) => {
            let message = e.to_string();
            render::template_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorPage { message: &message },
            )
        }
    }
}

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "word": state.config.word,
        "status": "running",
        "bigquery_available": state.is_available(),
    }))
}
