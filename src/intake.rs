//! Bounded intake queue between the broker callback path and the batcher
//!
//! Single producer (the session's event loop), single consumer (the batch
//! coordinator). The push side never suspends: when the queue is full the
//! message is dropped and counted. This is the sole admission-control point
//! in the pipeline; everything downstream assumes it can do its work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::message::Telemetry;

/// Default queue capacity
pub const DEFAULT_INTAKE_CAPACITY: usize = 4096;

/// Create a bounded intake queue.
///
/// Dropping the last [`IntakeSender`] closes the queue; the receiver then
/// drains whatever is buffered and observes end-of-stream.
pub fn channel(capacity: usize) -> (IntakeSender, mpsc::Receiver<Telemetry>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        IntakeSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Non-blocking producer handle
///
/// Clones share the same drop counter so the total reflects every producer.
#[derive(Clone)]
pub struct IntakeSender {
    tx: mpsc::Sender<Telemetry>,
    dropped: Arc<AtomicU64>,
}

impl IntakeSender {
    /// Push a telemetry datum without blocking.
    ///
    /// Returns `false` when the message was dropped (queue full or closed).
    pub fn push(&self, telemetry: Telemetry) -> bool {
        match self.tx.try_send(telemetry) {
            Ok(()) => true,
            Err(TrySendError::Full(rejected)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    gateway_id = %rejected.gateway_id,
                    device_id = %rejected.device_id_raw,
                    dropped_total = total,
                    "intake queue full, dropping telemetry"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("intake queue closed, dropping telemetry");
                false
            }
        }
    }

    /// Total messages dropped due to overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
