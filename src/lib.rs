//! VIRTA - MQTT telemetry ingestion service
//!
//! Subscribes to an MQTT broker, classifies sensor topics, coalesces decoded
//! telemetry into bounded batches, and durably records each reading through
//! the control-plane HTTP API that owns the datastore.
//!
//! ```text
//! Broker ──► Ingress ──► Intake Queue ──► Batch Coordinator ──► Control Plane
//!   ▲           │                               │                 (HTTP, retry
//!   │           │                               │                  + breaker)
//!   └───────────┴── diagnostics on ingestor/errors/<gateway>/<device>
//! ```
//!
//! Data flows top-down; control (cancellation, shutdown) flows bottom-up.
//! The only backpressure point is the intake queue's non-blocking push:
//! when the batcher stalls, excess messages are dropped and counted there,
//! and nothing upstream ever blocks the broker's IO path.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod api;
pub mod batch;
pub mod config;
pub mod error;
pub mod health;
pub mod ingress;
pub mod intake;
pub mod message;
pub mod publisher;
pub mod session;
pub mod topic;

pub use api::{ApiClient, ApiError, BreakerSnapshot, BreakerState, CircuitBreaker, ControlPlane, RetryPolicy};
pub use batch::BatchCoordinator;
pub use config::{
    BatchConfig, BrokerConfig, Config, ConfigError, ControlPlaneConfig, ResilienceConfig,
};
pub use error::{Result, VirtaError};
pub use health::HealthState;
pub use ingress::Ingress;
pub use intake::IntakeSender;
pub use message::{decode_payload, Payload, RawMessage, Reading, Telemetry};
pub use publisher::{DiagnosticSink, ErrorKind, ErrorPublisher};
pub use session::{SessionDriver, SessionHandle};
pub use topic::{classify, TopicClass};
