//! Broker callback path
//!
//! Invoked synchronously from the session's poll loop for every inbound
//! publish. Decodes the body, classifies the topic, and either pushes a
//! [`Telemetry`] into the intake queue (non-blocking, drop on overflow) or
//! reports an `invalid_topic` diagnostic. This is the strict seam between
//! the broker's IO path and the batcher: nothing here ever suspends.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::intake::IntakeSender;
use crate::message::{decode_payload, RawMessage, Telemetry};
use crate::publisher::{DiagnosticSink, ErrorKind};
use crate::topic::{classify, TopicClass};

/// Classifier + enqueuer for inbound broker messages
pub struct Ingress {
    sensor_prefix: String,
    intake: IntakeSender,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl Ingress {
    pub fn new(
        sensor_prefix: String,
        intake: IntakeSender,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            sensor_prefix,
            intake,
            diagnostics,
        }
    }

    /// Handle one raw broker message.
    pub fn handle(&self, raw: RawMessage) {
        debug!(topic = %raw.topic, bytes = raw.body.len(), "received broker message");

        match classify(&self.sensor_prefix, &raw.topic) {
            TopicClass::Rejected {
                reason,
                gateway_id,
                device_id_raw,
            } => {
                warn!(topic = %raw.topic, "invalid topic format");
                self.diagnostics.publish_error(
                    &gateway_id,
                    &device_id_raw,
                    ErrorKind::InvalidTopic,
                    &reason,
                );
            }
            TopicClass::Accepted {
                gateway_id,
                device_id_raw,
                metric,
            } => {
                let telemetry = Telemetry {
                    gateway_id,
                    device_id_raw,
                    payload: decode_payload(&raw.body),
                    topic: raw.topic,
                    received_at: raw.received_at,
                };
                debug!(
                    gateway_id = %telemetry.gateway_id,
                    device_id = %telemetry.device_id_raw,
                    metric = %metric,
                    "queueing telemetry"
                );
                // Overflow is logged and counted inside the sender
                self.intake.push(telemetry);
            }
        }
    }
}
