//! Health HTTP surface
//!
//! One endpoint, `GET /health`, aggregating the broker session state, a live
//! probe of the control plane, and the circuit-breaker snapshot. Returns 200
//! when both upstreams are reachable, 503 otherwise.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{ApiClient, BreakerSnapshot};
use crate::error::VirtaError;
use crate::session::SessionHandle;

/// Cap on the control-plane liveness probe inside the handler
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for the health server
#[derive(Clone)]
pub struct HealthState {
    pub session: SessionHandle,
    pub api: Arc<ApiClient>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    services: ServiceStatuses,
    circuit_breaker: BreakerSnapshot,
}

#[derive(Serialize)]
struct ServiceStatuses {
    mqtt: &'static str,
    api_service: &'static str,
}

/// Bind and start the health server.
///
/// Binding is fatal at startup; after that the server runs until the
/// cancellation token fires.
pub async fn start(
    port: u16,
    state: HealthState,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, VirtaError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(VirtaError::Bind)?;
    info!(port, "health server listening");

    let app = Router::new()
        .route("/health", get(health_handler))
        .with_state(state);

    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            error!(error = %err, "health server error");
        }
    }))
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mqtt_up = state.session.is_connected();
    let api_up = matches!(
        tokio::time::timeout(LIVENESS_TIMEOUT, state.api.liveness()).await,
        Ok(Ok(()))
    );
    let healthy = mqtt_up && api_up;

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        timestamp: Utc::now(),
        services: ServiceStatuses {
            mqtt: if mqtt_up { "connected" } else { "disconnected" },
            api_service: if api_up { "connected" } else { "disconnected" },
        },
        circuit_breaker: state.api.breaker_snapshot(),
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
