//! Protocol engine: per-opcode dispatch, session lifecycle, subscription
//! aggregation, and broker-to-device distribution.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerLink, BrokerMessage};
use crate::client::{Client, Transport};
use crate::error::Result;
use crate::index::TopicIndex;
use crate::protocol::{
    Connect, Flags, Message, Publish, RegAck, Register, ReturnCode, SubAck, Subscribe,
    TopicSpec, TOPIC_ID_TYPE_NORMAL,
};
use crate::registry::ClientRegistry;
use crate::tree::TopicTree;
use crate::types::QoS;

/// Reference-counted bridge to the upstream broker.
///
/// Tracks how many local subscriptions exist per topic string; the 0→1
/// transition opens the upstream subscription and 1→0 closes it.
struct Aggregator {
    broker: Arc<dyn BrokerLink>,
    counts: Mutex<HashMap<String, usize>>,
}

impl Aggregator {
    fn new(broker: Arc<dyn BrokerLink>) -> Self {
        Self {
            broker,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Take a reference on `topic`, opening the upstream subscription for
    /// the first subscriber. A failed upstream subscribe releases the
    /// reference again.
    async fn add_ref(&self, topic: &str) -> Result<()> {
        let first = {
            let mut counts = self.counts.lock();
            let n = counts.entry(topic.to_string()).or_insert(0);
            *n += 1;
            *n == 1
        };
        if !first {
            return Ok(());
        }

        debug!(topic, "first subscriber; subscribing upstream");
        match self.broker.subscribe(topic, QoS::ExactlyOnce).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.drop_ref(topic);
                Err(e)
            }
        }
    }

    /// Release a reference on `topic`, closing the upstream subscription
    /// when the last one goes.
    async fn remove_ref(&self, topic: &str) -> Result<()> {
        if self.drop_ref(topic) {
            debug!(topic, "last subscriber gone; unsubscribing upstream");
            self.broker.unsubscribe(topic).await?;
        }
        Ok(())
    }

    /// Decrement the count; true when it reached zero.
    fn drop_ref(&self, topic: &str) -> bool {
        let mut counts = self.counts.lock();
        match counts.get_mut(topic) {
            Some(n) if *n > 1 => {
                *n -= 1;
                false
            }
            Some(_) => {
                counts.remove(topic);
                true
            }
            None => false,
        }
    }
}

/// The aggregating gateway core.
///
/// One instance serves all datagram clients; handlers are driven by the
/// UDP listener and the broker message sink.
pub struct Gateway {
    index: TopicIndex,
    tree: TopicTree,
    clients: ClientRegistry,
    broker: Arc<dyn BrokerLink>,
    transport: Arc<dyn Transport>,
    aggregation: Aggregator,
    /// Serializes subscription mutations so tree, refcounts, and the
    /// upstream broker cannot disagree while a subscribe is in flight.
    sub_lock: tokio::sync::Mutex<()>,
    next_msg_id: AtomicU16,
}

impl Gateway {
    pub fn new(broker: Arc<dyn BrokerLink>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            index: TopicIndex::new(),
            tree: TopicTree::new(),
            clients: ClientRegistry::new(),
            broker: Arc::clone(&broker),
            transport,
            aggregation: Aggregator::new(broker),
            sub_lock: tokio::sync::Mutex::new(()),
            next_msg_id: AtomicU16::new(1),
        })
    }

    /// Install this gateway as the broker's message sink. Each incoming
    /// broker message is distributed on its own task.
    pub fn install_distributor(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        self.broker.set_on_message(Box::new(move |msg| {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway.distribute(msg).await;
            });
        }));
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn index(&self) -> &TopicIndex {
        &self.index
    }

    pub fn tree(&self) -> &TopicTree {
        &self.tree
    }

    /// Decode and dispatch one incoming datagram.
    ///
    /// Never fails: every error path logs and drops.
    pub async fn on_packet(&self, buf: &[u8], addr: SocketAddr) {
        let msg = match Message::decode(buf) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%addr, error = %e, "dropping undecodable datagram");
                return;
            }
        };

        debug!(kind = %msg.msg_type(), %addr, "datagram received");

        match msg {
            Message::Connect(connect) => self.handle_connect(connect, addr).await,
            Message::Register(register) => self.handle_register(register, addr).await,
            Message::RegAck(regack) => self.handle_regack(regack, addr).await,
            Message::Publish(publish) => self.handle_publish(publish, addr).await,
            Message::Subscribe(subscribe) => self.handle_subscribe(subscribe, addr).await,
            Message::PingReq { .. } => self.handle_pingreq(addr).await,
            Message::Disconnect { duration } => self.handle_disconnect(duration, addr).await,
            other => debug!(kind = %other.msg_type(), %addr, "ignoring"),
        }
    }

    async fn handle_connect(&self, connect: Connect, addr: SocketAddr) {
        if connect.client_id.is_empty() {
            warn!(%addr, "CONNECT without client id ignored");
            return;
        }

        // A reconnect under the same id supersedes the old session; its
        // subscriptions must be gone before the new session goes live.
        if self.clients.get_by_id(&connect.client_id).is_some() {
            info!(client = %connect.client_id, "replacing existing session");
            self.teardown(&connect.client_id).await;
        }

        let client = Arc::new(Client::new(
            &connect.client_id,
            addr,
            Arc::clone(&self.transport),
        ));
        client.set_will(connect.flags.will);
        self.clients.add(Arc::clone(&client));

        if let Err(e) = client.send(&Message::ConnAck { code: ReturnCode::Accepted }).await {
            warn!(client = %client.id(), error = %e, "CONNACK send failed");
            return;
        }
        info!(client = %client.id(), %addr, will = connect.flags.will, "client connected");
    }

    async fn handle_register(&self, register: Register, addr: SocketAddr) {
        let Some(client) = self.clients.get_by_addr(addr) else {
            warn!(%addr, "REGISTER from unknown client");
            return;
        };

        let (topic_id, code) = match self.index.get_or_assign(&register.topic) {
            Ok(id) => {
                client.mark_registered(id);
                (id, ReturnCode::Accepted)
            }
            Err(e) => {
                error!(topic = %register.topic, error = %e, "topic id assignment failed");
                (0, ReturnCode::InvalidTopicId)
            }
        };

        let ack = Message::RegAck(RegAck {
            topic_id,
            msg_id: register.msg_id,
            code,
        });
        if let Err(e) = client.send(&ack).await {
            warn!(client = %client.id(), error = %e, "REGACK send failed");
        }
    }

    /// The client acknowledges a topic id the gateway pushed earlier:
    /// everything queued for that id can now be delivered, oldest first.
    async fn handle_regack(&self, regack: RegAck, addr: SocketAddr) {
        let Some(client) = self.clients.get_by_addr(addr) else {
            warn!(%addr, "REGACK from unknown client");
            return;
        };

        if regack.code != ReturnCode::Accepted {
            warn!(
                client = %client.id(),
                topic_id = regack.topic_id,
                code = ?regack.code,
                "REGISTER rejected by client; dropping pending publishes"
            );
            client.drain_pending(regack.topic_id);
            return;
        }

        let pending = client.drain_pending(regack.topic_id);
        if pending.is_empty() {
            // The gateway only REGISTERs with a publish queued, so an
            // empty queue on an unregistered id means the id is unknown.
            debug!(client = %client.id(), topic_id = regack.topic_id, "REGACK with nothing pending");
            return;
        }

        client.mark_registered(regack.topic_id);
        for msg in pending {
            if let Err(e) = client.send(&msg).await {
                warn!(client = %client.id(), error = %e, "pending publish send failed");
            }
        }
    }

    async fn handle_publish(&self, publish: Publish, addr: SocketAddr) {
        let Some(topic) = self.index.lookup_topic(publish.topic_id) else {
            warn!(%addr, topic_id = publish.topic_id, "PUBLISH with unknown topic id dropped");
            return;
        };

        match self
            .broker
            .publish(&topic, QoS::ExactlyOnce, publish.payload.clone())
            .await
        {
            Ok(()) => debug!(topic = %topic, "publish forwarded upstream"),
            Err(e) => warn!(topic = %topic, error = %e, "upstream publish failed; dropped"),
        }
    }

    async fn handle_subscribe(&self, subscribe: Subscribe, addr: SocketAddr) {
        let Some(client) = self.clients.get_by_addr(addr) else {
            warn!(%addr, "SUBSCRIBE from unknown client");
            return;
        };

        let topic = match (&subscribe.topic, subscribe.flags.topic_id_type) {
            (TopicSpec::Name(name), TOPIC_ID_TYPE_NORMAL) => name.clone(),
            _ => {
                // TODO: pre-defined and short topic ids
                debug!(client = %client.id(), "unsupported topic id type on SUBSCRIBE");
                self.send_suback(&client, &subscribe, 0, ReturnCode::NotSupported).await;
                return;
            }
        };

        // Wildcard subscriptions cannot be pre-registered; the concrete
        // topics get REGISTERed at fan-out time instead.
        let topic_id = if topic.contains('+') || topic.contains('#') {
            0
        } else {
            match self.index.get_or_assign(&topic) {
                Ok(id) => id,
                Err(e) => {
                    error!(topic = %topic, error = %e, "topic id assignment failed");
                    self.send_suback(&client, &subscribe, 0, ReturnCode::InvalidTopicId).await;
                    return;
                }
            }
        };

        let _guard = self.sub_lock.lock().await;

        let outcome = match self.tree.add_subscription(&client, &topic) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(client = %client.id(), topic = %topic, error = %e, "subscription rejected");
                self.send_suback(&client, &subscribe, 0, ReturnCode::InvalidTopicId).await;
                return;
            }
        };

        if outcome.added {
            if let Err(e) = self.aggregation.add_ref(&topic).await {
                // Roll the insertion back so the next attempt is first again.
                let _ = self.tree.remove_subscription(client.id(), &topic);
                warn!(client = %client.id(), topic = %topic, error = %e, "upstream subscribe failed");
                self.send_suback(&client, &subscribe, 0, ReturnCode::Congestion).await;
                return;
            }
        }

        if topic_id != 0 {
            client.mark_registered(topic_id);
        }
        info!(client = %client.id(), topic = %topic, topic_id, "subscribed");
        self.send_suback(&client, &subscribe, topic_id, ReturnCode::Accepted).await;
    }

    async fn send_suback(
        &self,
        client: &Arc<Client>,
        subscribe: &Subscribe,
        topic_id: u16,
        code: ReturnCode,
    ) {
        let ack = Message::SubAck(SubAck {
            flags: Flags {
                qos: subscribe.flags.qos,
                ..Flags::default()
            },
            topic_id,
            msg_id: subscribe.msg_id,
            code,
        });
        if let Err(e) = client.send(&ack).await {
            warn!(client = %client.id(), error = %e, "SUBACK send failed");
        }
    }

    async fn handle_pingreq(&self, addr: SocketAddr) {
        let buf = Message::PingResp.encode();
        if let Err(e) = self.transport.send_to(&buf, addr).await {
            warn!(%addr, error = %e, "PINGRESP send failed");
        }
    }

    async fn handle_disconnect(&self, duration: Option<u16>, addr: SocketAddr) {
        let Some(client) = self.clients.get_by_addr(addr) else {
            debug!(%addr, "DISCONNECT from unknown client");
            return;
        };

        match duration {
            Some(d) if d > 0 => {
                client.set_asleep(true);
                info!(client = %client.id(), duration = d, "client entering sleep");
            }
            _ => {
                info!(client = %client.id(), "client disconnected");
                self.teardown(client.id()).await;
            }
        }
    }

    /// Remove the session, sweep its subscriptions out of the tree, and
    /// release the matching upstream references.
    async fn teardown(&self, client_id: &str) {
        let _guard = self.sub_lock.lock().await;
        if self.clients.remove(client_id).is_none() {
            return;
        }
        for (topic, _last) in self.tree.remove_client(client_id) {
            if let Err(e) = self.aggregation.remove_ref(&topic).await {
                warn!(topic = %topic, error = %e, "upstream unsubscribe failed");
            }
        }
    }

    /// Fan an incoming broker message out to every matching client.
    ///
    /// Each client gets its own task; ordering per client is preserved by
    /// the session's send serialization.
    pub async fn distribute(&self, msg: BrokerMessage) {
        debug!(topic = %msg.topic, "distributing broker message");

        let subscribers = match self.tree.subscribers_of(&msg.topic) {
            Ok(subscribers) => subscribers,
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "dropping unmatchable broker message");
                return;
            }
        };
        if subscribers.is_empty() {
            debug!(topic = %msg.topic, "no subscribers");
            return;
        }

        let topic_id = match self.lookup_or_assign(&msg.topic) {
            Ok(id) => id,
            Err(e) => {
                error!(topic = %msg.topic, error = %e, "topic id assignment failed");
                return;
            }
        };

        let publish = Message::Publish(Publish {
            flags: Flags {
                dup: msg.dup,
                qos: QoS::clamp_device(msg.qos),
                retain: msg.retain,
                topic_id_type: TOPIC_ID_TYPE_NORMAL,
                ..Flags::default()
            },
            topic_id,
            msg_id: 0,
            payload: msg.payload.clone(),
        });

        let mut tasks = Vec::with_capacity(subscribers.len());
        for client in subscribers {
            let publish = publish.clone();
            let topic = msg.topic.clone();
            let msg_id = self.next_msg_id();
            tasks.push(tokio::spawn(publish_to_client(
                client, topic_id, publish, topic, msg_id,
            )));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    fn lookup_or_assign(&self, topic: &str) -> Result<u16> {
        match self.index.lookup_id(topic) {
            0 => self.index.get_or_assign(topic),
            id => Ok(id),
        }
    }

    /// Fresh non-zero message id for gateway-originated messages.
    fn next_msg_id(&self) -> u16 {
        loop {
            let id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

/// Deliver one publish to one client, going through the REGISTER handshake
/// first when the client has never seen the topic id.
async fn publish_to_client(
    client: Arc<Client>,
    topic_id: u16,
    publish: Message,
    topic: String,
    msg_id: u16,
) {
    if client.is_registered(topic_id) {
        if let Err(e) = client.send(&publish).await {
            warn!(client = %client.id(), error = %e, "publish send failed");
        }
        return;
    }

    // Queue first: the publish must not be lost if the REGACK races in.
    client.enqueue_pending(topic_id, publish);
    let register = Message::Register(Register {
        topic_id,
        msg_id,
        topic,
    });
    if let Err(e) = client.send(&register).await {
        warn!(client = %client.id(), error = %e, "REGISTER send failed");
    }
}
