//! Webhook ingest HTTP server (axum): validate, authenticate, dedup,
//! publish, return. The response never waits for worker completion.

use crate::admission::DedupGate;
use crate::cache::create_cache;
use crate::config::Config;
use crate::metrics::{Counter, MetricsStore};
use crate::queue::{create_queue, Queue};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB).
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Header carrying the shared webhook secret, set by the Telegram Bot API.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Shared state for the ingest handlers.
#[derive(Clone)]
pub struct IngestState {
    pub queue: Arc<dyn Queue>,
    pub metrics: Arc<MetricsStore>,
    pub dedup: DedupGate,
    pub topic: String,
    /// Trimmed shared secret; `None` disables the check.
    pub webhook_secret: Option<Arc<str>>,
    /// Ingest-level dedup window; `None` disables the claim.
    pub webhook_dedup_ttl: Option<Duration>,
}

pub fn router(state: IngestState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/webhook", post(handle_webhook))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Run the ingest server until the listener fails or the process stops.
pub async fn run(config: &Config) -> anyhow::Result<()> {
    let metrics = Arc::new(MetricsStore::open(&config.metrics.store_path));
    let cache = create_cache(&config.cache, Arc::clone(&metrics))?;
    let queue = create_queue(&config.queue, Arc::clone(&metrics)).await?;

    let state = IngestState {
        queue,
        metrics,
        dedup: DedupGate::new(cache),
        topic: config.queue.topic.clone(),
        webhook_secret: config
            .ingest
            .webhook_secret
            .as_deref()
            .map(str::trim)
            .filter(|secret| !secret.is_empty())
            .map(Arc::from),
        webhook_dedup_ttl: (config.dedup.webhook_ttl_secs > 0)
            .then(|| Duration::from_secs(config.dedup.webhook_ttl_secs)),
    };

    let addr: SocketAddr = format!("{}:{}", config.ingest.host, config.ingest.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("ingest server listening on {addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// GET /health. Liveness only, no secrets.
async fn handle_health() -> &'static str {
    "ok"
}

/// GET /metrics. Flat `name value` text snapshot.
async fn handle_metrics(State(state): State<IngestState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render_text(),
    )
}

fn finish(state: &IngestState, started: Instant) -> f64 {
    let elapsed = started.elapsed();
    state.metrics.record_webhook_latency(elapsed);
    elapsed.as_secs_f64() * 1_000.0
}

/// POST /webhook. Authenticate, validate, claim, enqueue, respond.
///
/// The response never waits for the queue: publishing happens on a spawned
/// task after the 200 is decided, with its own log-and-count error handling.
async fn handle_webhook(
    State(state): State<IngestState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let started = Instant::now();
    state.metrics.incr(Counter::WebhookRequests);

    if let Some(expected) = &state.webhook_secret {
        let got = headers
            .get(SECRET_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim);
        if got != Some(expected.as_ref()) {
            state.metrics.incr(Counter::WebhookUnauthorized);
            tracing::warn!("unauthorized webhook: bad or missing secret header");
            finish(&state, started);
            return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"ok": false})));
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!("webhook body is not json: {err}");
            finish(&state, started);
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"ok": false, "error": "invalid_payload"})),
            );
        }
    };
    let Some(update_id) = payload.get("update_id").and_then(Value::as_i64) else {
        tracing::warn!("webhook payload has no numeric update_id");
        finish(&state, started);
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"ok": false, "error": "invalid_payload"})),
        );
    };

    if let Some(ttl) = state.webhook_dedup_ttl {
        if state.dedup.seen(&format!("ingest:{update_id}"), ttl).await {
            tracing::info!("ingest dedup drop for update {update_id}");
            let latency_ms = finish(&state, started);
            return (
                StatusCode::OK,
                Json(serde_json::json!({"ok": true, "dedup": true, "latency_ms": latency_ms})),
            );
        }
    }

    let queue = Arc::clone(&state.queue);
    let topic = state.topic.clone();
    let attributes = HashMap::from([
        ("update_id".to_string(), update_id.to_string()),
        ("source".to_string(), "webhook".to_string()),
    ]);
    tokio::spawn(async move {
        match queue.publish(&topic, payload, attributes).await {
            Ok(()) => tracing::info!("webhook enqueued update {update_id} on {topic}"),
            Err(err) => {
                tracing::error!("webhook enqueue failed for update {update_id}: {err:#}");
            }
        }
    });

    let latency_ms = finish(&state, started);
    (
        StatusCode::OK,
        Json(serde_json::json!({"ok": true, "latency_ms": latency_ms})),
    )
}
