//! HTTP health endpoint.
//!
//! `GET /health` reports node identity, bus mode, queue depths, breaker
//! states and per-adapter connectivity; `GET /ready` flips to 200 once the
//! kernel has emitted `system.ready`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::adapter::AdapterRegistry;
use crate::breaker::BreakerRegistry;
use crate::bus::BusMode;
use crate::error::{CoreError, Result};
use crate::queue::QueueManager;

pub struct HealthState {
    pub node_id: String,
    pub bus_mode: BusMode,
    pub started_at: Instant,
    pub ready: Arc<AtomicBool>,
    pub queues: Arc<QueueManager>,
    pub breakers: Arc<BreakerRegistry>,
    pub adapters: Arc<AdapterRegistry>,
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state)
}

/// Bind and serve; runs until the process exits.
pub async fn serve(state: Arc<HealthState>, port: u16) -> Result<()> {
    let app = router(state);
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| CoreError::fatal(format!("bind health server on {addr}: {e}")))?;
    info!(%addr, "Health endpoint listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| CoreError::fatal(format!("health server: {e}")))
}

pub fn spawn(state: Arc<HealthState>, port: u16) {
    tokio::spawn(async move {
        if let Err(err) = serve(state, port).await {
            error!(error = %err, "Health server exited");
        }
    });
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> Json<Value> {
    let queues: Value = state
        .queues
        .snapshot()
        .into_iter()
        .map(|(name, stats)| (name, serde_json::to_value(stats).unwrap_or(Value::Null)))
        .collect::<serde_json::Map<String, Value>>()
        .into();

    let breakers: Value = state
        .breakers
        .snapshot()
        .into_iter()
        .map(|(name, (breaker_state, metrics))| {
            (
                name,
                json!({
                    "state": breaker_state,
                    "metrics": metrics,
                }),
            )
        })
        .collect::<serde_json::Map<String, Value>>()
        .into();

    let mut adapters = serde_json::Map::new();
    for adapter in state.adapters.all() {
        let health = tokio::time::timeout(Duration::from_secs(2), adapter.health()).await;
        let entry = match health {
            Ok(Ok(status)) => json!({
                "online": status.online,
                "detail": status.detail,
            }),
            Ok(Err(err)) => json!({ "online": false, "detail": err.to_string() }),
            Err(_) => json!({ "online": false, "detail": "health check timed out" }),
        };
        adapters.insert(adapter.name().to_string(), entry);
    }

    Json(json!({
        "status": if state.ready.load(Ordering::Relaxed) { "ok" } else { "starting" },
        "node_id": state.node_id,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "bus_mode": state.bus_mode.as_str(),
        "queues": queues,
        "breakers": breakers,
        "adapters": Value::Object(adapters),
    }))
}

async fn ready_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}
