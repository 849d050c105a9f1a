//! OAuth redirect listener.
//!
//! `GET /oauth/callback?state=..&code=..` completes a pending authorization. A provider-reported
//! `error` is passed back to the user and leaves the pending attempt in place.

use crate::gateway::{Gateway, completion_json};
use anyhow::Context as _;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/oauth/callback", get(oauth_callback))
        .with_state(gateway)
}

async fn health() -> &'static str {
    "ok"
}

async fn oauth_callback(
    State(gateway): State<Arc<Gateway>>,
    Query(q): Query<CallbackQuery>,
) -> Response {
    if let Some(error) = q.error {
        tracing::warn!(error = %error, "authorization provider returned an error");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": error, "message": q.error_description})),
        )
            .into_response();
    }

    let (Some(state), Some(code)) = (q.state, q.code) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_request", "message": "state and code are required"})),
        )
            .into_response();
    };

    let result = gateway.complete_authorization(&state, &code).await;
    let status = if result.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(completion_json(&result))).into_response()
}

/// Serve the callback router until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the server fails while running.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("callback listener address")?;
    tracing::info!(%addr, "oauth callback listener started");
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("oauth callback listener")
}
