//! Upstream MQTT broker link.
//!
//! The gateway talks to the broker through the [`BrokerLink`] trait; the
//! production implementation wraps a rumqttc [`AsyncClient`] and resolves
//! subscribe/unsubscribe/publish receipts from the event stream. Tests
//! substitute a recording fake.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::types::QoS;

/// Message delivered by the broker on a subscribed topic.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
}

/// Sink for messages arriving from the broker.
pub type MessageHandler = Box<dyn Fn(BrokerMessage) + Send + Sync>;

/// The five upstream operations the gateway needs from an MQTT client.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Establish the connection; errors here are fatal at startup.
    async fn connect(&self) -> Result<()>;

    /// Subscribe and wait for the broker's SUBACK.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    /// Unsubscribe and wait for the broker's UNSUBACK.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Publish and wait for the delivery receipt (QoS > 0).
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()>;

    /// Register the single message sink for subscribed topics.
    fn set_on_message(&self, handler: MessageHandler);

    /// Disconnect from the broker.
    async fn disconnect(&self) -> Result<()>;
}

/// Receipt channels resolved by the event loop, in arrival order.
///
/// The gateway serializes subscription changes, so FIFO matching of acks
/// to waiters is sufficient here.
#[derive(Default)]
struct Receipts {
    sub: Mutex<VecDeque<oneshot::Sender<()>>>,
    unsub: Mutex<VecDeque<oneshot::Sender<()>>>,
    publish: Mutex<VecDeque<oneshot::Sender<()>>>,
}

struct LinkShared {
    connected: AtomicBool,
    handler: RwLock<Option<MessageHandler>>,
    receipts: Receipts,
}

/// rumqttc-backed [`BrokerLink`].
pub struct RumqttcLink {
    client: AsyncClient,
    timeout: Duration,
    shared: Arc<LinkShared>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RumqttcLink {
    /// Build the link and spawn its event-loop task.
    ///
    /// Broker address format: `mqtt://[user:pass@]host:port`.
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let url = Url::parse(&config.broker_url)
            .map_err(|e| Error::InvalidConfig(format!("broker url: {}", e)))?;
        let host = url.host_str().unwrap_or("127.0.0.1").to_string();
        let port = url.port().unwrap_or(1883);

        let client_id = config
            .mqtt_client_id
            .clone()
            .unwrap_or_else(|| "sngate".to_string());

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(password) = url.password() {
            options.set_credentials(url.username(), password);
        }
        if let Some(user) = &config.mqtt_user {
            options.set_credentials(user, config.mqtt_password.as_deref().unwrap_or(""));
        }

        let (client, event_loop) = AsyncClient::new(options, 100);

        let shared = Arc::new(LinkShared {
            connected: AtomicBool::new(false),
            handler: RwLock::new(None),
            receipts: Receipts::default(),
        });
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(run_event_loop(event_loop, Arc::clone(&shared), shutdown_rx));

        Ok(Self {
            client,
            timeout: config.timeout(),
            shared,
            shutdown_tx,
        })
    }

    async fn await_receipt(&self, rx: oneshot::Receiver<()>, what: &str) -> Result<()> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Upstream(format!("{}: receipt channel closed", what))),
            Err(_) => Err(Error::UpstreamTimeout(what.to_string())),
        }
    }
}

#[async_trait]
impl BrokerLink for RumqttcLink {
    async fn connect(&self) -> Result<()> {
        let start = tokio::time::Instant::now();
        while !self.shared.connected.load(Ordering::SeqCst) {
            if start.elapsed() > self.timeout {
                return Err(Error::Connection(format!(
                    "no CONNACK from broker within {:?}",
                    self.timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.shared.receipts.sub.lock().push_back(tx);
        self.client
            .subscribe(topic, qos.into())
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;
        self.await_receipt(rx, topic).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.shared.receipts.unsub.lock().push_back(tx);
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;
        self.await_receipt(rx, topic).await
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()> {
        if qos == QoS::AtMostOnce {
            return self
                .client
                .publish(topic, qos.into(), false, payload)
                .await
                .map_err(|e| Error::Upstream(e.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        self.shared.receipts.publish.lock().push_back(tx);
        self.client
            .publish(topic, qos.into(), false, payload)
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;
        self.await_receipt(rx, topic).await
    }

    fn set_on_message(&self, handler: MessageHandler) {
        *self.shared.handler.write() = Some(handler);
    }

    async fn disconnect(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.client
            .disconnect()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(())
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    shared: Arc<LinkShared>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("broker event loop stopping");
                return;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to upstream broker");
                    shared.connected.store(true, Ordering::SeqCst);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(topic = %publish.topic, "message from broker");
                    let msg = BrokerMessage {
                        topic: publish.topic.clone(),
                        payload: Bytes::from(publish.payload.to_vec()),
                        qos: publish.qos as u8,
                        retain: publish.retain,
                        dup: publish.dup,
                    };
                    if let Some(handler) = shared.handler.read().as_ref() {
                        handler(msg);
                    } else {
                        warn!(topic = %publish.topic, "no message sink installed; dropping");
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    if let Some(tx) = shared.receipts.sub.lock().pop_front() {
                        let _ = tx.send(());
                    }
                }
                Ok(Event::Incoming(Packet::UnsubAck(_))) => {
                    if let Some(tx) = shared.receipts.unsub.lock().pop_front() {
                        let _ = tx.send(());
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(_)))
                | Ok(Event::Incoming(Packet::PubComp(_))) => {
                    if let Some(tx) = shared.receipts.publish.lock().pop_front() {
                        let _ = tx.send(());
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "broker event loop error");
                    shared.connected.store(false, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        }
    }
}
