//! Control-plane HTTP client
//!
//! The control plane owns the datastore; this client consumes three internal
//! endpoints (gateway validation, device validation, reading insert) plus a
//! liveness probe. Every validating/inserting call runs inside a retry +
//! circuit-breaker envelope; the liveness probe runs bare so the health
//! surface sees the backend as it is right now.
//!
//! The [`ControlPlane`] trait is the seam the batch coordinator depends on,
//! so tests can substitute an in-memory fake.

mod breaker;
mod retry;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use retry::RetryPolicy;

use std::future::Future;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ControlPlaneConfig, ResilienceConfig};
use crate::error::VirtaError;
use crate::message::Reading;

/// User-agent presented on every control-plane request
pub const USER_AGENT: &str = "virta-ingestor";

/// Error type for control-plane operations
#[derive(Error, Debug)]
pub enum ApiError {
    /// Rejected without network IO; the backend is considered unhealthy
    #[error("circuit breaker is open")]
    BreakerOpen,

    /// Transport-level failure (connect, timeout, decode)
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The control plane answered with an unexpected status
    #[error("control plane returned status {0}")]
    Status(u16),

    /// The control plane reported an application-level error
    #[error("control plane error: {0}")]
    Api(String),

    /// The cancellation signal fired during the call or a retry wait
    #[error("operation cancelled")]
    Cancelled,

    /// Every attempt failed
    #[error("operation failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<ApiError>,
    },
}

impl ApiError {
    /// True when the call was rejected by the open breaker.
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, ApiError::BreakerOpen)
    }

    /// True when the call was aborted by cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }
}

/// The narrow capability the batch coordinator needs from the control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Does the gateway exist? Strictly the boolean of a 200 response.
    async fn validate_gateway(
        &self,
        cancel: &CancellationToken,
        gateway_id: &str,
    ) -> Result<bool, ApiError>;

    /// Does the device exist under this gateway?
    async fn validate_device(
        &self,
        cancel: &CancellationToken,
        gateway_id: &str,
        device_id: i64,
    ) -> Result<bool, ApiError>;

    /// Durably record one reading.
    async fn insert_reading(
        &self,
        cancel: &CancellationToken,
        reading: &Reading,
    ) -> Result<(), ApiError>;
}

#[derive(Serialize)]
struct ValidateGatewayRequest<'a> {
    pi_id: &'a str,
}

#[derive(Serialize)]
struct ValidateDeviceRequest<'a> {
    pi_id: &'a str,
    device_id: i64,
}

#[derive(Deserialize)]
struct ValidateResponse {
    exists: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct InsertResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Retry + breaker envelope shared by all mutating/validating calls
struct Resilience {
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl Resilience {
    fn new(cfg: &ResilienceConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(cfg.breaker_max_failures, cfg.breaker_reset),
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                base_delay: cfg.retry_base,
            },
        }
    }

    /// Run `op` with up to `max_retries` retries behind the breaker.
    ///
    /// The breaker is consulted before every attempt; each failed attempt
    /// counts against its budget and each success zeroes it. Cancellation
    /// during the round trip or a backoff wait aborts with
    /// [`ApiError::Cancelled`] and leaves the failure budget untouched.
    async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut last_error = ApiError::BreakerOpen;

        for attempt in 0..=self.retry.max_retries {
            if !self.breaker.try_acquire() {
                return Err(ApiError::BreakerOpen);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                outcome = op() => outcome,
            };

            match outcome {
                Ok(value) => {
                    self.breaker.on_success();
                    if attempt > 0 {
                        debug!(attempt, "control-plane call recovered after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    self.breaker.on_failure();
                    warn!(
                        attempt,
                        max_retries = self.retry.max_retries,
                        error = %err,
                        "control-plane call failed"
                    );
                    last_error = err;
                }
            }

            if attempt == self.retry.max_retries {
                break;
            }

            let delay = self.retry.delay_for_attempt(attempt);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(ApiError::Exhausted {
            attempts: self.retry.max_retries + 1,
            source: Box::new(last_error),
        })
    }
}

/// HTTP client for the control-plane API
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    resilience: Resilience,
}

impl ApiClient {
    /// Build the client: pooled connections, per-request timeout, bearer
    /// secret attached to every request.
    pub fn new(
        cfg: &ControlPlaneConfig,
        resilience: &ResilienceConfig,
    ) -> Result<Self, VirtaError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", cfg.secret))
            .map_err(|_| VirtaError::Config(crate::config::ConfigError::Invalid {
                name: "INTERNAL_API_SECRET",
                value: "<redacted>".to_string(),
            }))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            http,
            resilience: Resilience::new(resilience),
        })
    }

    /// Read-only breaker view for the health surface.
    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.resilience.breaker.snapshot()
    }

    /// `GET /health/live`, used by the health probe. No retry, no breaker.
    pub async fn liveness(&self) -> Result<(), ApiError> {
        let response = self
            .http
            .get(self.url("/health/live"))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(ApiError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn validate_gateway_once(&self, gateway_id: &str) -> Result<bool, ApiError> {
        let response = self
            .http
            .post(self.url("/internal/pis/validate"))
            .json(&ValidateGatewayRequest { pi_id: gateway_id })
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(ApiError::Status(response.status().as_u16()));
        }

        let body: ValidateResponse = response.json().await?;
        if let Some(error) = body.error.filter(|e| !e.is_empty()) {
            return Err(ApiError::Api(error));
        }
        Ok(body.exists)
    }

    async fn validate_device_once(
        &self,
        gateway_id: &str,
        device_id: i64,
    ) -> Result<bool, ApiError> {
        let response = self
            .http
            .post(self.url("/internal/devices/validate"))
            .json(&ValidateDeviceRequest {
                pi_id: gateway_id,
                device_id,
            })
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(ApiError::Status(response.status().as_u16()));
        }

        let body: ValidateResponse = response.json().await?;
        if let Some(error) = body.error.filter(|e| !e.is_empty()) {
            return Err(ApiError::Api(error));
        }
        Ok(body.exists)
    }

    async fn insert_reading_once(&self, reading: &Reading) -> Result<(), ApiError> {
        let response = self
            .http
            .post(self.url("/internal/readings"))
            .json(reading)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            return Err(ApiError::Status(status.as_u16()));
        }

        let body: InsertResponse = response.json().await?;
        if !body.success {
            if let Some(error) = body.error.filter(|e| !e.is_empty()) {
                return Err(ApiError::Api(error));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for ApiClient {
    async fn validate_gateway(
        &self,
        cancel: &CancellationToken,
        gateway_id: &str,
    ) -> Result<bool, ApiError> {
        self.resilience
            .execute(cancel, || self.validate_gateway_once(gateway_id))
            .await
    }

    async fn validate_device(
        &self,
        cancel: &CancellationToken,
        gateway_id: &str,
        device_id: i64,
    ) -> Result<bool, ApiError> {
        self.resilience
            .execute(cancel, || self.validate_device_once(gateway_id, device_id))
            .await
    }

    async fn insert_reading(
        &self,
        cancel: &CancellationToken,
        reading: &Reading,
    ) -> Result<(), ApiError> {
        self.resilience
            .execute(cancel, || self.insert_reading_once(reading))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn resilience(max_retries: u32, max_failures: u32, reset: Duration) -> Resilience {
        Resilience {
            breaker: CircuitBreaker::new(max_failures, reset),
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_secs(1),
            },
        }
    }

    /// Operation that fails `failures` times, then succeeds
    fn flaky_op(
        failures: u32,
    ) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<u32, ApiError>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                std::future::ready(Err(ApiError::Status(503)))
            } else {
                std::future::ready(Ok(n))
            }
        };
        (calls, op)
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_first_try_with_one_call() {
        let envelope = resilience(3, 5, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let (calls, op) = flaky_op(0);

        let result = envelope.execute(&cancel, op).await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(envelope.breaker.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let envelope = resilience(3, 5, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let (calls, op) = flaky_op(2);

        let result = envelope.execute(&cancel, op).await;

        assert!(result.is_ok());
        // 2 failures + 1 success
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Success zeroes the budget
        assert_eq!(envelope.breaker.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_retries() {
        let envelope = resilience(2, 10, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let (calls, op) = flaky_op(u32::MAX);

        let err = envelope.execute(&cancel, op).await.unwrap_err();

        // 1 initial + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            ApiError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, ApiError::Status(503)));
            }
            other => panic!("expected Exhausted, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_rejects_without_invoking_op() {
        let envelope = resilience(0, 2, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        // Two failing calls open the breaker
        for _ in 0..2 {
            let (_, op) = flaky_op(u32::MAX);
            let _ = envelope.execute(&cancel, op).await;
        }
        assert_eq!(envelope.breaker.snapshot().state, BreakerState::Open);

        // The next call fails fast and never reaches the operation
        let (calls, op) = flaky_op(0);
        let err = envelope.execute(&cancel, op).await.unwrap_err();
        assert!(err.is_breaker_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn probe_after_reset_closes_breaker() {
        let envelope = resilience(0, 1, Duration::from_millis(10));
        let cancel = CancellationToken::new();

        let (_, failing) = flaky_op(u32::MAX);
        let _ = envelope.execute(&cancel, failing).await;
        assert_eq!(envelope.breaker.snapshot().state, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(15)).await;

        let (calls, op) = flaky_op(0);
        let result = envelope.execute(&cancel, op).await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snap = envelope.breaker.snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_aborts() {
        let envelope = resilience(3, 10, Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            // Fires while the envelope sits in its first backoff wait
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let (calls, op) = flaky_op(u32::MAX);
        let err = envelope.execute(&cancel, op).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_token_short_circuits() {
        let envelope = resilience(3, 10, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (calls, op) = flaky_op(0);
        let err = envelope.execute(&cancel, op).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // Cancellation is not a failure classification
        assert_eq!(envelope.breaker.snapshot().failure_count, 0);
    }
}
