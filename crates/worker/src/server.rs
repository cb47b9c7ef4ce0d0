use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use browserpool_common::ServerConfig;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::{metrics_response, Metrics};
use crate::options::SessionOptions;
use crate::pool::BrowserWorkerPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: BrowserWorkerPool,
    pub metrics: Metrics,
    pub auth_key: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .route("/task", post(submit_task))
        .with_state(state)
}

/// Bind and serve until the token is cancelled.
pub async fn serve(
    config: &ServerConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("HTTP server listening on {addr}");
    if state.auth_key.is_none() {
        warn!("no auth key configured, task submission is open");
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server error")?;
    Ok(())
}

/// The key, when configured, must arrive verbatim in `Authorization`.
fn authorized(headers: &HeaderMap, auth_key: Option<&str>) -> bool {
    let Some(key) = auth_key else {
        return true;
    };
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|presented| presented == key)
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "status": "UNAUTHORIZED" })),
    )
}

async fn health() -> Json<Value> {
    Json(json!({ "health": "ok" }))
}

async fn stats(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers, state.auth_key.as_deref()) {
        return unauthorized().into_response();
    }
    let snapshot = state
        .pool
        .stats()
        .snapshot(state.pool.queue_length(), state.pool.max_workers());
    Json(snapshot).into_response()
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers, state.auth_key.as_deref()) {
        return unauthorized().into_response();
    }
    metrics_response(&state.metrics, &state.pool)
        .await
        .into_response()
}

/// Submit a script and hold the request open until the task settles.
///
/// Tasks requeued after a browser crash settle on a later attempt, so the
/// response always carries the final outcome, never the crash.
async fn submit_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    if !authorized(&headers, state.auth_key.as_deref()) {
        return unauthorized().into_response();
    }

    let Some((script, options)) = parse_task_request(&body) else {
        return Json(json!({ "status": "WRONG_INPUT" })).into_response();
    };

    let (tx, rx) = oneshot::channel();
    state.pool.add_task(
        script,
        Box::new(move |status, payload, timing| {
            // Client may have hung up; nothing left to notify then.
            let _ = tx.send((status, payload, timing));
        }),
        Some(options),
    );

    match rx.await {
        Ok((status, payload, timing)) => Json(json!({
            "status": status,
            "metadata": timing,
            "data": payload,
        }))
        .into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "FAIL", "data": { "error": "FATAL" } })),
        )
            .into_response(),
    }
}

/// `script` must be a string; `options`, when present, must deserialize.
fn parse_task_request(body: &Value) -> Option<(String, SessionOptions)> {
    let script = body.get("script")?.as_str()?.to_string();
    let options = match body.get("options") {
        Some(raw) if !raw.is_null() => serde_json::from_value(raw.clone()).ok()?,
        _ => SessionOptions::default(),
    };
    Some((script, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn auth_passes_without_configured_key() {
        assert!(authorized(&HeaderMap::new(), None));
    }

    #[test]
    fn auth_requires_exact_key() {
        let mut headers = HeaderMap::new();
        assert!(!authorized(&headers, Some("secret")));

        headers.insert(AUTHORIZATION, "wrong".parse().unwrap());
        assert!(!authorized(&headers, Some("secret")));

        headers.insert(AUTHORIZATION, "secret".parse().unwrap());
        assert!(authorized(&headers, Some("secret")));
    }

    #[test]
    fn task_request_requires_string_script() {
        assert!(parse_task_request(&json!({ "script": "resolve(1);" })).is_some());
        assert!(parse_task_request(&json!({ "script": 42 })).is_none());
        assert!(parse_task_request(&json!({})).is_none());
        assert!(parse_task_request(&json!({ "script": null })).is_none());
    }

    #[test]
    fn task_request_parses_options() {
        let (script, options) = parse_task_request(&json!({
            "script": "resolve(1);",
            "options": {
                "locale": "de-DE",
                "viewport": { "width": 800, "height": 600 },
                "permissions": ["notifications"]
            }
        }))
        .unwrap();
        assert_eq!(script, "resolve(1);");
        assert_eq!(options.locale.as_deref(), Some("de-DE"));
        assert_eq!(options.viewport.unwrap().width, 800);

        // Malformed options are an input error, not silently dropped.
        assert!(parse_task_request(&json!({
            "script": "resolve(1);",
            "options": { "viewport": "wide" }
        }))
        .is_none());
    }
}
