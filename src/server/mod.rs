//! Status and health endpoint
//!
//! Small axum app exposing `GET /health` (aggregated worker health from
//! the bus) and `GET /calls` (active call snapshots). Returns 503 when any
//! worker reports unhealthy or has gone quiet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::{Bus, HealthReport, HealthStatus, Payload, Topic};
use crate::call::CallRegistry;
use crate::stats::EngineStats;
use crate::store::ArtifactStore;

/// A worker's report is stale after this long without a heartbeat
const HEALTH_STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct ServerState {
    registry: Arc<CallRegistry>,
    artifacts: Arc<ArtifactStore>,
    bus: Arc<Bus>,
    engine_stats: Arc<EngineStats>,
    health: Arc<Mutex<HashMap<String, (HealthReport, Instant)>>>,
}

impl ServerState {
    pub fn new(
        registry: Arc<CallRegistry>,
        artifacts: Arc<ArtifactStore>,
        bus: Arc<Bus>,
        engine_stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            registry,
            artifacts,
            bus,
            engine_stats,
            health: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Collect worker heartbeats off the bus into the state map
fn spawn_health_collector(
    state: ServerState,
    bus: Arc<Bus>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut subscription = bus.subscribe(Topic::Health);
        loop {
            let envelope = tokio::select! {
                envelope = subscription.recv() => envelope,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            if let Payload::Health(report) = envelope.payload {
                state
                    .health
                    .lock()
                    .unwrap()
                    .insert(report.worker.clone(), (report, Instant::now()));
            }
        }
    });
}

async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let now = Instant::now();
    let mut healthy = true;
    let mut workers = serde_json::Map::new();

    for (name, (report, seen)) in state.health.lock().unwrap().iter() {
        let stale = now.duration_since(*seen) > HEALTH_STALE_AFTER;
        if stale || report.status == HealthStatus::Unhealthy {
            healthy = false;
        }
        workers.insert(
            name.clone(),
            json!({
                "status": report.status,
                "stale": stale,
                "uptime_s": report.uptime_s,
                "queue_depth": report.queue_depth,
                "error_rate": report.error_rate,
                "backend_latency_ms_p50": report.backend_latency_ms_p50,
                "backend_latency_ms_p95": report.backend_latency_ms_p95,
            }),
        );
    }

    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "active_calls": state.registry.active_count(),
        "bus_subscribers": state.bus.subscriber_count(),
        "engine": state.engine_stats.snapshot(),
        "artifacts": {
            "active": state.artifacts.active_count(),
            "stats": state.artifacts.stats(),
        },
        "workers": workers,
    });

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

async fn calls_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({ "calls": state.registry.snapshots() }))
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/calls", get(calls_handler))
        .with_state(state)
}

/// Bind and serve the status app until shutdown
pub async fn spawn_server(
    host: &str,
    port: u16,
    registry: Arc<CallRegistry>,
    artifacts: Arc<ArtifactStore>,
    bus: Arc<Bus>,
    engine_stats: Arc<EngineStats>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let state = ServerState::new(registry, artifacts, bus.clone(), engine_stats);
    spawn_health_collector(state.clone(), bus, shutdown.clone());

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!(host, port, "status server listening");

    let app = router(state);
    let mut shutdown = shutdown;
    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        });
        if let Err(e) = serve.await {
            warn!(error = %e, "status server stopped");
        }
    });
    Ok(())
}
