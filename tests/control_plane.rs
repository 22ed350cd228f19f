//! HTTP contract tests for the control-plane client
//!
//! Spins up a local axum server standing in for the control plane and
//! exercises the real `ApiClient` against it: auth header, request body
//! shapes, status handling, retry counts, and breaker short-circuiting.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use virta_ingestor::api::{ApiClient, ApiError, BreakerState, ControlPlane};
use virta_ingestor::config::{ControlPlaneConfig, ResilienceConfig};
use virta_ingestor::message::{decode_payload, Reading};

#[derive(Clone, Debug)]
struct Recorded {
    path: &'static str,
    authorization: Option<String>,
    body: Value,
}

struct MockControlPlane {
    requests: Mutex<Vec<Recorded>>,
    /// Respond 503 to this many requests before behaving normally
    fail_remaining: AtomicU32,
    gateway_exists: bool,
    device_exists: bool,
}

impl MockControlPlane {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            fail_remaining: AtomicU32::new(0),
            gateway_exists: true,
            device_exists: true,
        })
    }

    fn requests_for(&self, path: &str) -> Vec<Recorded> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    fn record(&self, path: &'static str, headers: &HeaderMap, body: Value) -> bool {
        self.requests.lock().push(Recorded {
            path,
            authorization: headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body,
        });

        // Report whether this request should fail
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

async fn validate_pi(
    State(state): State<Arc<MockControlPlane>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if state.record("/internal/pis/validate", &headers, body) {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({})));
    }
    (StatusCode::OK, Json(json!({ "exists": state.gateway_exists })))
}

async fn validate_device(
    State(state): State<Arc<MockControlPlane>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if state.record("/internal/devices/validate", &headers, body) {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({})));
    }
    (StatusCode::OK, Json(json!({ "exists": state.device_exists })))
}

async fn create_reading(
    State(state): State<Arc<MockControlPlane>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if state.record("/internal/readings", &headers, body) {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({})));
    }
    (StatusCode::CREATED, Json(json!({ "success": true })))
}

async fn health_live() -> StatusCode {
    StatusCode::OK
}

async fn spawn_mock(state: Arc<MockControlPlane>) -> String {
    let app = Router::new()
        .route("/internal/pis/validate", post(validate_pi))
        .route("/internal/devices/validate", post(validate_device))
        .route("/internal/readings", post(create_reading))
        .route("/health/live", get(health_live))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn make_client(base_url: String, max_retries: u32, breaker_max_failures: u32) -> ApiClient {
    ApiClient::new(
        &ControlPlaneConfig {
            base_url,
            secret: "test-secret".to_string(),
            timeout: Duration::from_secs(5),
        },
        &ResilienceConfig {
            max_retries,
            retry_base: Duration::from_millis(5),
            breaker_max_failures,
            breaker_reset: Duration::from_secs(30),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn validate_gateway_sends_bearer_and_pi_id() {
    let mock = MockControlPlane::new();
    let base_url = spawn_mock(mock.clone()).await;
    let client = make_client(base_url, 0, 5);
    let cancel = CancellationToken::new();

    let exists = client.validate_gateway(&cancel, "pi_001").await.unwrap();
    assert!(exists);

    let requests = mock.requests_for("/internal/pis/validate");
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].authorization.as_deref(),
        Some("Bearer test-secret")
    );
    assert_eq!(requests[0].body, json!({ "pi_id": "pi_001" }));
}

#[tokio::test]
async fn validate_gateway_passes_through_not_found() {
    let mock = Arc::new(MockControlPlane {
        requests: Mutex::new(Vec::new()),
        fail_remaining: AtomicU32::new(0),
        gateway_exists: false,
        device_exists: true,
    });
    let base_url = spawn_mock(mock.clone()).await;
    let client = make_client(base_url, 0, 5);
    let cancel = CancellationToken::new();

    let exists = client.validate_gateway(&cancel, "pi_ghost").await.unwrap();
    assert!(!exists);
}

#[tokio::test]
async fn validate_device_sends_numeric_device_id() {
    let mock = MockControlPlane::new();
    let base_url = spawn_mock(mock.clone()).await;
    let client = make_client(base_url, 0, 5);
    let cancel = CancellationToken::new();

    let exists = client.validate_device(&cancel, "pi_001", 42).await.unwrap();
    assert!(exists);

    let requests = mock.requests_for("/internal/devices/validate");
    assert_eq!(requests[0].body, json!({ "pi_id": "pi_001", "device_id": 42 }));
}

#[tokio::test]
async fn insert_reading_posts_full_shape_and_accepts_201() {
    let mock = MockControlPlane::new();
    let base_url = spawn_mock(mock.clone()).await;
    let client = make_client(base_url, 0, 5);
    let cancel = CancellationToken::new();

    let reading = Reading {
        gateway_id: "pi_001".to_string(),
        device_id: 42,
        ts: "2025-01-01T00:00:00Z".parse().unwrap(),
        payload: decode_payload(br#"{"temp": 22.5}"#),
    };
    client.insert_reading(&cancel, &reading).await.unwrap();

    let requests = mock.requests_for("/internal/readings");
    assert_eq!(requests.len(), 1);
    let body = &requests[0].body;
    assert_eq!(body["pi_id"], "pi_001");
    assert_eq!(body["device_id"], 42);
    assert_eq!(body["ts"], "2025-01-01T00:00:00Z");
    assert_eq!(body["payload"]["temp"], 22.5);
}

#[tokio::test]
async fn transient_failures_are_retried_to_success() {
    let mock = MockControlPlane::new();
    mock.fail_remaining.store(2, Ordering::SeqCst);
    let base_url = spawn_mock(mock.clone()).await;
    let client = make_client(base_url, 3, 10);
    let cancel = CancellationToken::new();

    let exists = client.validate_gateway(&cancel, "pi_001").await.unwrap();
    assert!(exists);

    // Two 503s plus the successful attempt
    assert_eq!(mock.requests_for("/internal/pis/validate").len(), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_last_status() {
    let mock = MockControlPlane::new();
    mock.fail_remaining.store(u32::MAX, Ordering::SeqCst);
    let base_url = spawn_mock(mock.clone()).await;
    let client = make_client(base_url, 2, 100);
    let cancel = CancellationToken::new();

    let err = client.validate_gateway(&cancel, "pi_001").await.unwrap_err();
    match err {
        ApiError::Exhausted { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*source, ApiError::Status(503)));
        }
        other => panic!("expected Exhausted, got {other}"),
    }
    assert_eq!(mock.requests_for("/internal/pis/validate").len(), 3);
}

#[tokio::test]
async fn open_breaker_short_circuits_without_http() {
    let mock = MockControlPlane::new();
    mock.fail_remaining.store(u32::MAX, Ordering::SeqCst);
    let base_url = spawn_mock(mock.clone()).await;
    let client = make_client(base_url, 0, 2);
    let cancel = CancellationToken::new();

    // Two failing calls exhaust the budget
    for _ in 0..2 {
        let _ = client.validate_gateway(&cancel, "pi_001").await;
    }
    assert_eq!(client.breaker_snapshot().state, BreakerState::Open);

    let err = client.validate_gateway(&cancel, "pi_001").await.unwrap_err();
    assert!(err.is_breaker_open());

    // The rejected call issued no request
    assert_eq!(mock.requests_for("/internal/pis/validate").len(), 2);
}

#[tokio::test]
async fn liveness_probe_hits_health_live() {
    let mock = MockControlPlane::new();
    let base_url = spawn_mock(mock.clone()).await;
    let client = make_client(base_url, 0, 5);

    client.liveness().await.unwrap();
}
