//! Batch coordinator
//!
//! Drains the intake queue into a size/time-bounded buffer and flushes it
//! through the control-plane client. A flush walks the buffer in insertion
//! order and, per item: parses the device id, validates the gateway,
//! validates the device, then inserts the reading. Every failure is terminal
//! for that item only; the batch always continues.
//!
//! The coordinator exits when the intake queue closes (graceful shutdown,
//! flushing what remains first) or when the abort token fires (second
//! signal, abandoning the rest of an in-progress flush).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, ControlPlane};
use crate::config::BatchConfig;
use crate::message::{Reading, Telemetry};
use crate::publisher::{DiagnosticSink, ErrorKind};

/// Aggregates intake into bounded batches and writes them out
pub struct BatchCoordinator {
    rx: mpsc::Receiver<Telemetry>,
    control_plane: Arc<dyn ControlPlane>,
    diagnostics: Arc<dyn DiagnosticSink>,
    batch_size: usize,
    batch_window: Duration,
    /// Hard-abort signal: drops the remainder of an in-progress flush
    abort: CancellationToken,
}

impl BatchCoordinator {
    pub fn new(
        rx: mpsc::Receiver<Telemetry>,
        control_plane: Arc<dyn ControlPlane>,
        diagnostics: Arc<dyn DiagnosticSink>,
        config: BatchConfig,
        abort: CancellationToken,
    ) -> Self {
        Self {
            rx,
            control_plane,
            diagnostics,
            batch_size: config.size,
            batch_window: config.window,
            abort,
        }
    }

    /// Run until the intake queue closes or the abort token fires.
    pub async fn run(mut self) {
        info!(
            batch_size = self.batch_size,
            batch_window_ms = self.batch_window.as_millis() as u64,
            "batch coordinator started"
        );

        let mut buffer: Vec<Telemetry> = Vec::with_capacity(self.batch_size);
        let window = sleep(self.batch_window);
        tokio::pin!(window);

        loop {
            tokio::select! {
                _ = self.abort.cancelled() => {
                    warn!(buffered = buffer.len(), "batch coordinator aborted");
                    break;
                }
                received = self.rx.recv() => match received {
                    Some(telemetry) => {
                        buffer.push(telemetry);
                        if buffer.len() >= self.batch_size {
                            self.flush(&mut buffer).await;
                            window.as_mut().reset(Instant::now() + self.batch_window);
                        }
                    }
                    None => {
                        info!(buffered = buffer.len(), "intake queue closed, flushing and exiting");
                        self.flush(&mut buffer).await;
                        break;
                    }
                },
                _ = window.as_mut() => {
                    self.flush(&mut buffer).await;
                    window.as_mut().reset(Instant::now() + self.batch_window);
                }
            }
        }

        info!("batch coordinator stopped");
    }

    /// Write out the buffered telemetry in insertion order.
    async fn flush(&self, buffer: &mut Vec<Telemetry>) {
        if buffer.is_empty() {
            return;
        }
        info!(batch_size = buffer.len(), "flushing batch to control plane");

        let mut processed = 0usize;
        for telemetry in buffer.drain(..) {
            if self.abort.is_cancelled() {
                warn!(processed, "flush aborted, dropping remaining items");
                break;
            }
            self.process(telemetry).await;
            processed += 1;
        }
    }

    /// Validate and insert one telemetry datum.
    async fn process(&self, telemetry: Telemetry) {
        let gateway_id = telemetry.gateway_id;
        let device_id_raw = telemetry.device_id_raw;

        let device_id: i64 = match device_id_raw.parse() {
            Ok(id) => id,
            Err(_) => {
                error!(
                    gateway_id = %gateway_id,
                    device_id = %device_id_raw,
                    "device id is not an integer"
                );
                self.diagnostics.publish_error(
                    &gateway_id,
                    &device_id_raw,
                    ErrorKind::DeviceIdParse,
                    &format!("device id {device_id_raw:?} is not an integer"),
                );
                return;
            }
        };

        match self
            .control_plane
            .validate_gateway(&self.abort, &gateway_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(gateway_id = %gateway_id, "skipping reading: gateway not found");
                self.diagnostics.publish_error(
                    &gateway_id,
                    &device_id_raw,
                    ErrorKind::GatewayNotFound,
                    &format!("gateway {gateway_id} does not exist"),
                );
                return;
            }
            Err(err) => {
                self.report_failure(
                    &gateway_id,
                    &device_id_raw,
                    ErrorKind::GatewayValidation,
                    &format!("failed to validate gateway {gateway_id}: {err}"),
                    &err,
                );
                return;
            }
        }

        match self
            .control_plane
            .validate_device(&self.abort, &gateway_id, device_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    gateway_id = %gateway_id,
                    device_id,
                    "skipping reading: device not found"
                );
                self.diagnostics.publish_error(
                    &gateway_id,
                    &device_id_raw,
                    ErrorKind::DeviceNotFound,
                    &format!("device {device_id} does not exist for gateway {gateway_id}"),
                );
                return;
            }
            Err(err) => {
                self.report_failure(
                    &gateway_id,
                    &device_id_raw,
                    ErrorKind::DeviceValidation,
                    &format!("failed to validate device {device_id}: {err}"),
                    &err,
                );
                return;
            }
        }

        let reading = Reading {
            gateway_id: gateway_id.clone(),
            device_id,
            ts: telemetry.received_at,
            payload: telemetry.payload,
        };
        if let Err(err) = self
            .control_plane
            .insert_reading(&self.abort, &reading)
            .await
        {
            self.report_failure(
                &gateway_id,
                &device_id_raw,
                ErrorKind::InsertFailed,
                &format!("failed to insert reading: {err}"),
                &err,
            );
        }
    }

    /// Log a per-item failure and emit the matching diagnostic.
    ///
    /// Breaker rejections keep their own tag regardless of which step they
    /// interrupted; cancellation produces no diagnostic at all.
    fn report_failure(
        &self,
        gateway_id: &str,
        device_id_raw: &str,
        step_kind: ErrorKind,
        message: &str,
        err: &ApiError,
    ) {
        if err.is_cancelled() {
            debug!(gateway_id = %gateway_id, "control-plane call cancelled");
            return;
        }
        let kind = if err.is_breaker_open() {
            ErrorKind::BreakerOpen
        } else {
            step_kind
        };
        error!(gateway_id = %gateway_id, device_id = %device_id_raw, error_type = %kind, "{message}");
        self.diagnostics
            .publish_error(gateway_id, device_id_raw, kind, message);
    }
}
