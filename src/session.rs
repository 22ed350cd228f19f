//! Resilient MQTT broker session
//!
//! One long-lived session: non-clean so the broker retains queued messages
//! across brief disconnects, auto-reconnecting by re-entering the poll loop
//! after a logged warning. The subscription is re-asserted on every ConnAck.
//!
//! Only the initial CONNECT is fatal; once [`connect`] has returned, every
//! connection-level error is a warning followed by a retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::VirtaError;
use crate::ingress::Ingress;
use crate::message::RawMessage;

/// Wait between reconnect attempts after a poll error
const RECONNECT_WAIT: Duration = Duration::from_secs(5);

/// Capacity of the client's outgoing request queue
const REQUEST_CAPACITY: usize = 64;

/// Cloneable handle over the live session
///
/// Safe to use from any task: publishing goes through the client's internal
/// request queue and never blocks.
#[derive(Clone)]
pub struct SessionHandle {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Is the session currently connected to the broker?
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Enqueue a QoS 1, non-retained publish without blocking.
    pub fn try_publish(&self, topic: String, payload: Vec<u8>) -> Result<(), ClientError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
    }
}

/// Owns the event loop; consumed by [`SessionDriver::run`]
pub struct SessionDriver {
    client: AsyncClient,
    eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    subscription: String,
}

/// Establish the session and assert the subscription.
///
/// Fails on unreadable CA material, a refused or timed-out initial CONNECT,
/// or a failed initial SUBSCRIBE. Returns a cloneable handle plus the driver
/// whose `run` future must be spawned.
pub async fn connect(cfg: &BrokerConfig) -> Result<(SessionHandle, SessionDriver), VirtaError> {
    let options = build_options(cfg)?;
    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let subscription = cfg.effective_topic();

    let connack = tokio::time::timeout(cfg.connect_timeout, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => continue,
                Err(err) => return Err(err),
            }
        }
    })
    .await;

    match connack {
        Err(_) => return Err(VirtaError::ConnectTimeout(cfg.connect_timeout)),
        Ok(Err(err)) => return Err(VirtaError::Connect(err)),
        Ok(Ok(())) => {}
    }

    client
        .subscribe(subscription.clone(), QoS::AtLeastOnce)
        .await?;
    info!(
        broker = %cfg.host,
        port = cfg.port,
        topic = %subscription,
        "connected to broker, subscription established"
    );

    let connected = Arc::new(AtomicBool::new(true));
    let handle = SessionHandle {
        client: client.clone(),
        connected: connected.clone(),
    };
    let driver = SessionDriver {
        client,
        eventloop,
        connected,
        subscription,
    };
    Ok((handle, driver))
}

fn build_options(cfg: &BrokerConfig) -> Result<MqttOptions, VirtaError> {
    let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    options.set_keep_alive(cfg.keepalive);
    options.set_clean_session(false);

    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        options.set_credentials(user.clone(), pass.clone());
    }

    if cfg.use_tls {
        // Config validation guarantees a CA path when TLS is on
        if let Some(path) = &cfg.ca_cert_path {
            let ca = std::fs::read(path).map_err(|source| VirtaError::TlsMaterial {
                path: path.display().to_string(),
                source,
            })?;
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }));
        }
    }

    Ok(options)
}

impl SessionDriver {
    /// Drive the session until cancelled.
    ///
    /// Every inbound publish is handed synchronously to the ingress, whose
    /// only downstream operation is a non-blocking intake push; the event
    /// loop is never held up by the batcher.
    pub async fn run(mut self, ingress: Ingress, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("broker session stopping");
                    self.connected.store(false, Ordering::SeqCst);
                    if let Err(err) = self.client.disconnect().await {
                        debug!(error = %err, "disconnect after cancellation");
                    }
                    break;
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        self.connected.store(true, Ordering::SeqCst);
                        info!(topic = %self.subscription, "broker session connected, asserting subscription");
                        if let Err(err) = self
                            .client
                            .subscribe(self.subscription.clone(), QoS::AtLeastOnce)
                            .await
                        {
                            error!(error = %err, topic = %self.subscription, "failed to subscribe");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        ingress.handle(RawMessage::new(publish.topic, publish.payload));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if self.connected.swap(false, Ordering::SeqCst) {
                            warn!(error = %err, "broker connection lost, reconnecting");
                        } else {
                            debug!(error = %err, "broker reconnect attempt failed");
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_WAIT) => {}
                        }
                    }
                }
            }
        }
    }
}
