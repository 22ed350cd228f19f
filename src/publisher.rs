//! Negative-acknowledgement diagnostics
//!
//! When a message cannot be ingested, a JSON diagnostic is published back
//! onto the broker on a parallel topic tree so the originating device learns
//! what went wrong. Devices subscribe to `ingestor/errors/#`; healthy
//! messages produce no output.

use std::fmt;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::session::SessionHandle;

/// Root of the diagnostic topic tree
pub const ERROR_TOPIC_PREFIX: &str = "ingestor/errors";

/// Why a message failed to ingest
///
/// The string forms appear both in structured logs and in the `error_type`
/// field of the published diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidTopic,
    DeviceIdParse,
    GatewayValidation,
    GatewayNotFound,
    DeviceValidation,
    DeviceNotFound,
    InsertFailed,
    /// The control plane is unhealthy; rejected without network IO
    BreakerOpen,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidTopic => "invalid_topic",
            ErrorKind::DeviceIdParse => "device_id_parse_error",
            ErrorKind::GatewayValidation => "gateway_validation_error",
            ErrorKind::GatewayNotFound => "gateway_not_found",
            ErrorKind::DeviceValidation => "device_validation_error",
            ErrorKind::DeviceNotFound => "device_not_found",
            ErrorKind::InsertFailed => "insert_failed",
            ErrorKind::BreakerOpen => "breaker_open",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-method capability over the broker session
///
/// The batch coordinator and ingress depend on this seam; tests substitute a
/// recording fake.
pub trait DiagnosticSink: Send + Sync {
    fn publish_error(&self, gateway_id: &str, device_id: &str, kind: ErrorKind, message: &str);
}

/// Publishes diagnostics onto `ingestor/errors/<gateway>/<device>`
///
/// QoS 1, non-retained. When the session is not connected the diagnostic is
/// dropped silently: the broker's replay semantics are deliberately not
/// relied on for negative acks.
pub struct ErrorPublisher {
    session: SessionHandle,
}

impl ErrorPublisher {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }
}

impl DiagnosticSink for ErrorPublisher {
    fn publish_error(&self, gateway_id: &str, device_id: &str, kind: ErrorKind, message: &str) {
        if !self.session.is_connected() {
            debug!(error_type = %kind, "broker disconnected, dropping diagnostic");
            return;
        }

        let payload = serde_json::json!({
            "error_type": kind.as_str(),
            "message": message,
            "pi_id": gateway_id,
            "device_id": device_id,
            "timestamp": Utc::now(),
        });
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "failed to encode diagnostic payload");
                return;
            }
        };

        let topic = format!("{ERROR_TOPIC_PREFIX}/{gateway_id}/{device_id}");
        match self.session.try_publish(topic.clone(), body) {
            Ok(()) => info!(topic = %topic, error_type = %kind, "published diagnostic"),
            Err(err) => warn!(topic = %topic, error = %err, "failed to publish diagnostic"),
        }
    }
}
