//! HTTP API for health checks, status, and monitoring

use crate::config::ApiConfig;
use crate::error::OrchestratorResult;
use crate::events::{EventBus, MonitoringEvent};
use crate::failover::{FailoverEngine, IntentStatus};
use crate::state::StateStore;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<FailoverEngine>,
    pub bus: Arc<EventBus>,
    pub store: Arc<StateStore>,
    pub chains: Vec<u64>,
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    engine: Arc<FailoverEngine>,
    bus: Arc<EventBus>,
    store: Arc<StateStore>,
    chains: Vec<u64>,
) -> OrchestratorResult<()> {
    let state = AppState {
        engine,
        bus,
        store,
        chains,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/intents", get(get_intents))
        .route("/events", get(get_events))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify dependencies
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.health_check().await.is_ok();

    let response = ReadinessResponse {
        ready: db_ok,
        database: db_ok,
        monitoring: state.engine.is_monitoring(),
    };

    if db_ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Get orchestrator status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        monitoring: state.engine.is_monitoring(),
        tracked_intents: state.engine.tracked_intents().len(),
        chains: state.chains.clone(),
    })
}

/// Get tracked intent statuses
async fn get_intents(State(state): State<AppState>) -> impl IntoResponse {
    Json(IntentsResponse {
        intents: state.engine.tracked_intents(),
    })
}

/// Get recent lifecycle events, oldest first
async fn get_events(State(state): State<AppState>) -> impl IntoResponse {
    Json(EventsResponse {
        events: state.bus.recent(),
    })
}

/// Get intent outcome statistics
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(StatsResponse {
                completed: stats.completed,
                failed: stats.failed,
                recovered: stats.recovered,
            }),
        ),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(StatsResponse {
                completed: 0,
                failed: 0,
                recovered: 0,
            }),
        ),
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    monitoring: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    monitoring: bool,
    tracked_intents: usize,
    chains: Vec<u64>,
}

#[derive(Serialize)]
struct IntentsResponse {
    intents: Vec<IntentStatus>,
}

#[derive(Serialize)]
struct EventsResponse {
    events: Vec<MonitoringEvent>,
}

#[derive(Serialize)]
struct StatsResponse {
    completed: u64,
    failed: u64,
    recovered: u64,
}
