//! Read-only HTTP API for health checks and protocol status

use crate::channel::ChannelManager;
use crate::config::ApiConfig;
use crate::coordination::TransactionCoordinator;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::state::{DecisionStats, StateManager};
use crate::types::parse_channel_id;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Absent when running on the in-memory store
    pub state_manager: Option<Arc<StateManager>>,
    pub coordinator: Arc<TransactionCoordinator>,
    pub channels: Arc<ChannelManager>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/transactions/:id", get(get_transaction))
        .route("/channels/:id", get(get_channel))
        .route("/stats", get(get_stats))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> CoordinatorResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoordinatorError::Config(format!("api bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the decision store is reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match &state.state_manager {
        Some(manager) => match manager.health_check().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Readiness check failed: {}", e);
                false
            }
        },
        None => true,
    };

    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: database,
            database,
        }),
    )
}

async fn get_transaction(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let tx_id = match Uuid::parse_str(&id) {
        Ok(tx_id) => tx_id,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "malformed transaction id"),
    };

    match state.coordinator.get(&tx_id).await {
        Some(txn) => Json(txn).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            &CoordinatorError::TransactionNotFound { tx_id: id }.to_string(),
        ),
    }
}

async fn get_channel(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let channel_id = match parse_channel_id(&id) {
        Some(channel_id) => channel_id,
        None => return error_response(StatusCode::BAD_REQUEST, "malformed channel id"),
    };

    match state.channels.get(&channel_id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e @ CoordinatorError::ChannelNotFound { .. }) => {
            error_response(StatusCode::NOT_FOUND, &e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// Protocol statistics
async fn get_stats(State(state): State<AppState>) -> Response {
    let decisions = match &state.state_manager {
        Some(manager) => match manager.get_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        },
        None => None,
    };

    Json(StatsResponse {
        uptime_seconds: state.started_at.elapsed().as_secs(),
        live_transactions: state.coordinator.transaction_count(),
        live_channels: state.channels.channel_count(),
        archived_channels: state.channels.archived_count(),
        decisions,
    })
    .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
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
}

#[derive(Serialize)]
struct StatsResponse {
    uptime_seconds: u64,
    live_transactions: usize,
    live_channels: usize,
    archived_channels: usize,
    decisions: Option<DecisionStats>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{DigestKeyring, DisputeResolver};
    use crate::config::CoordinatorConfig;
    use crate::events::EventBus;
    use crate::registry::ShardRegistry;
    use crate::shard::LocalTransport;
    use crate::state::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::default();
        let coordinator = TransactionCoordinator::new(
            Arc::new(ShardRegistry::new()),
            Arc::new(LocalTransport::new()),
            store.clone(),
            store.clone(),
            events.clone(),
            CoordinatorConfig::default(),
        );
        let channels = ChannelManager::new(
            store,
            Arc::new(DigestKeyring::new()),
            DisputeResolver::new(Duration::from_secs(60)),
            events,
        );
        router(AppState {
            state_manager: None,
            coordinator: Arc::new(coordinator),
            channels: Arc::new(channels),
            started_at: Instant::now(),
        })
    }

    async fn status_of(uri: &str) -> StatusCode {
        app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        assert_eq!(status_of("/health").await, StatusCode::OK);
        assert_eq!(status_of("/ready").await, StatusCode::OK);
        assert_eq!(status_of("/stats").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_lookups() {
        assert_eq!(status_of("/transactions/not-a-uuid").await, StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(&format!("/transactions/{}", Uuid::new_v4())).await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_of("/channels/zz").await, StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(&format!("/channels/{}", hex::encode([3u8; 32]))).await,
            StatusCode::NOT_FOUND
        );
    }
}
