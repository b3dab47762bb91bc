//! Gateway end-to-end scenarios against fake collaborators.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::broker::{BrokerLink, BrokerMessage, MessageHandler};
use crate::client::Transport;
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::protocol::{
    Connect, Flags, Message, Publish, RegAck, ReturnCode, Subscribe, TopicSpec,
    TOPIC_ID_TYPE_PREDEFINED,
};
use crate::types::QoS;

/// Transport that records every datagram instead of sending it.
struct RecordingTransport {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingTransport {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Decoded messages sent to `addr`, in order.
    fn sent_to(&self, addr: SocketAddr) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, buf)| Message::decode(buf).expect("gateway sent undecodable datagram"))
            .collect()
    }

    fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        self.sent.lock().push((addr, buf.to_vec()));
        Ok(buf.len())
    }
}

/// Broker link that records calls and acknowledges instantly.
struct FakeBroker {
    subscribes: Mutex<Vec<String>>,
    unsubscribes: Mutex<Vec<String>>,
    publishes: Mutex<Vec<(String, Bytes)>>,
    handler: RwLock<Option<MessageHandler>>,
    fail_subscribes: AtomicBool,
}

impl FakeBroker {
    fn new() -> Self {
        Self {
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
            publishes: Mutex::new(Vec::new()),
            handler: RwLock::new(None),
            fail_subscribes: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BrokerLink for FakeBroker {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<()> {
        self.subscribes.lock().push(topic.to_string());
        if self.fail_subscribes.load(Ordering::SeqCst) {
            return Err(Error::UpstreamTimeout(topic.to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.unsubscribes.lock().push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, _qos: QoS, payload: Bytes) -> Result<()> {
        self.publishes.lock().push((topic.to_string(), payload));
        Ok(())
    }

    fn set_on_message(&self, handler: MessageHandler) {
        *self.handler.write() = Some(handler);
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

struct Harness {
    gateway: Arc<Gateway>,
    transport: Arc<RecordingTransport>,
    broker: Arc<FakeBroker>,
}

fn harness() -> Harness {
    let transport = Arc::new(RecordingTransport::new());
    let broker = Arc::new(FakeBroker::new());
    let gateway = Gateway::new(
        Arc::clone(&broker) as Arc<dyn BrokerLink>,
        Arc::clone(&transport) as Arc<dyn Transport>,
    );
    Harness {
        gateway,
        transport,
        broker,
    }
}

fn addr(n: u16) -> SocketAddr {
    format!("127.0.0.1:{}", 40000 + n).parse().unwrap()
}

async fn connect(h: &Harness, client_id: &str, from: SocketAddr) {
    let msg = Message::Connect(Connect {
        flags: Flags::default(),
        protocol_id: 0x01,
        duration: 60,
        client_id: client_id.to_string(),
    });
    h.gateway.on_packet(&msg.encode(), from).await;
}

async fn subscribe(h: &Harness, from: SocketAddr, topic: &str, msg_id: u16) {
    let msg = Message::Subscribe(Subscribe {
        flags: Flags::default(),
        msg_id,
        topic: TopicSpec::Name(topic.to_string()),
    });
    h.gateway.on_packet(&msg.encode(), from).await;
}

async fn disconnect(h: &Harness, from: SocketAddr) {
    h.gateway
        .on_packet(&Message::Disconnect { duration: None }.encode(), from)
        .await;
}

fn broker_message(topic: &str, payload: &[u8]) -> BrokerMessage {
    BrokerMessage {
        topic: topic.to_string(),
        payload: Bytes::copy_from_slice(payload),
        qos: 1,
        retain: false,
        dup: false,
    }
}

#[tokio::test]
async fn connect_gets_connack() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;

    let sent = h.transport.sent_to(addr(1));
    assert_eq!(sent, vec![Message::ConnAck { code: ReturnCode::Accepted }]);
    assert!(h.gateway.clients().get_by_id("gear-001").is_some());
}

#[tokio::test]
async fn empty_client_id_is_silently_ignored() {
    let h = harness();
    connect(&h, "", addr(1)).await;

    assert!(h.transport.sent_to(addr(1)).is_empty());
    assert!(h.gateway.clients().is_empty());
}

#[tokio::test]
async fn pingreq_gets_pingresp() {
    let h = harness();
    h.gateway
        .on_packet(&Message::PingReq { client_id: None }.encode(), addr(9))
        .await;

    assert_eq!(h.transport.sent_to(addr(9)), vec![Message::PingResp]);
}

#[tokio::test]
async fn register_assigns_id_and_acks() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;

    let msg = Message::Register(crate::protocol::Register {
        topic_id: 0,
        msg_id: 5,
        topic: "sensor/1/temp".to_string(),
    });
    h.gateway.on_packet(&msg.encode(), addr(1)).await;

    let sent = h.transport.sent_to(addr(1));
    let Message::RegAck(ack) = &sent[1] else {
        panic!("expected REGACK, got {:?}", sent[1]);
    };
    assert_eq!(ack.msg_id, 5);
    assert_eq!(ack.code, ReturnCode::Accepted);
    assert_ne!(ack.topic_id, 0);

    let client = h.gateway.clients().get_by_id("gear-001").unwrap();
    assert!(client.is_registered(ack.topic_id));
}

#[tokio::test]
async fn subscribe_concrete_topic_registers_id() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;
    subscribe(&h, addr(1), "sensor/1/temp", 3).await;

    let sent = h.transport.sent_to(addr(1));
    let Message::SubAck(ack) = &sent[1] else {
        panic!("expected SUBACK, got {:?}", sent[1]);
    };
    assert_eq!(ack.code, ReturnCode::Accepted);
    assert_eq!(ack.msg_id, 3);
    assert_ne!(ack.topic_id, 0);

    let client = h.gateway.clients().get_by_id("gear-001").unwrap();
    assert!(client.is_registered(ack.topic_id));
    assert_eq!(h.broker.subscribes.lock().as_slice(), ["sensor/1/temp"]);
}

#[tokio::test]
async fn subscribe_wildcard_leaves_id_unassigned() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;
    subscribe(&h, addr(1), "sensor/#", 4).await;

    let sent = h.transport.sent_to(addr(1));
    let Message::SubAck(ack) = &sent[1] else {
        panic!("expected SUBACK, got {:?}", sent[1]);
    };
    assert_eq!(ack.code, ReturnCode::Accepted);
    assert_eq!(ack.topic_id, 0);
    assert_eq!(h.broker.subscribes.lock().as_slice(), ["sensor/#"]);
}

#[tokio::test]
async fn subscribe_unsupported_topic_id_type() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;

    let msg = Message::Subscribe(Subscribe {
        flags: Flags {
            topic_id_type: TOPIC_ID_TYPE_PREDEFINED,
            ..Flags::default()
        },
        msg_id: 6,
        topic: TopicSpec::Id(42),
    });
    h.gateway.on_packet(&msg.encode(), addr(1)).await;

    let sent = h.transport.sent_to(addr(1));
    let Message::SubAck(ack) = &sent[1] else {
        panic!("expected SUBACK, got {:?}", sent[1]);
    };
    assert_eq!(ack.code, ReturnCode::NotSupported);
    assert!(h.broker.subscribes.lock().is_empty());
}

#[tokio::test]
async fn subscribe_malformed_topic_rejected() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;
    subscribe(&h, addr(1), "a//b", 7).await;

    let sent = h.transport.sent_to(addr(1));
    let Message::SubAck(ack) = &sent[1] else {
        panic!("expected SUBACK, got {:?}", sent[1]);
    };
    assert_eq!(ack.code, ReturnCode::InvalidTopicId);
    assert!(h.broker.subscribes.lock().is_empty());
}

#[tokio::test]
async fn upstream_subscribe_failure_rolls_back() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;

    h.broker.fail_subscribes.store(true, Ordering::SeqCst);
    subscribe(&h, addr(1), "foo", 8).await;

    let sent = h.transport.sent_to(addr(1));
    let Message::SubAck(ack) = &sent[1] else {
        panic!("expected SUBACK, got {:?}", sent[1]);
    };
    assert_eq!(ack.code, ReturnCode::Congestion);
    assert!(h.gateway.tree().subscribers_of("foo").unwrap().is_empty());

    // the rollback makes the next attempt the first subscriber again
    h.broker.fail_subscribes.store(false, Ordering::SeqCst);
    h.transport.clear();
    subscribe(&h, addr(1), "foo", 9).await;

    let sent = h.transport.sent_to(addr(1));
    let Message::SubAck(ack) = &sent[0] else {
        panic!("expected SUBACK, got {:?}", sent[0]);
    };
    assert_eq!(ack.code, ReturnCode::Accepted);
    assert_eq!(h.broker.subscribes.lock().len(), 2);
    assert_eq!(h.gateway.tree().subscribers_of("foo").unwrap().len(), 1);
}

#[tokio::test]
async fn publish_forwards_upstream() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;

    h.gateway
        .on_packet(
            &Message::Register(crate::protocol::Register {
                topic_id: 0,
                msg_id: 1,
                topic: "actuator/1".to_string(),
            })
            .encode(),
            addr(1),
        )
        .await;
    let sent = h.transport.sent_to(addr(1));
    let Message::RegAck(ack) = &sent[1] else {
        panic!("expected REGACK, got {:?}", sent[1]);
    };

    let publish = Message::Publish(Publish {
        flags: Flags::default(),
        topic_id: ack.topic_id,
        msg_id: 0,
        payload: Bytes::from_static(b"on"),
    });
    h.gateway.on_packet(&publish.encode(), addr(1)).await;

    assert_eq!(
        h.broker.publishes.lock().as_slice(),
        [("actuator/1".to_string(), Bytes::from_static(b"on"))]
    );
}

#[tokio::test]
async fn publish_with_unknown_topic_id_is_dropped() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;

    let publish = Message::Publish(Publish {
        flags: Flags::default(),
        topic_id: 999,
        msg_id: 0,
        payload: Bytes::from_static(b"x"),
    });
    h.gateway.on_packet(&publish.encode(), addr(1)).await;

    assert!(h.broker.publishes.lock().is_empty());
}

#[tokio::test]
async fn aggregation_opens_one_upstream_subscription() {
    let h = harness();
    connect(&h, "c1", addr(1)).await;
    connect(&h, "c2", addr(2)).await;

    subscribe(&h, addr(1), "foo", 1).await;
    subscribe(&h, addr(2), "foo", 2).await;
    assert_eq!(h.broker.subscribes.lock().as_slice(), ["foo"]);

    disconnect(&h, addr(1)).await;
    assert!(h.broker.unsubscribes.lock().is_empty());

    disconnect(&h, addr(2)).await;
    assert_eq!(h.broker.unsubscribes.lock().as_slice(), ["foo"]);
    assert!(h.gateway.clients().is_empty());
}

#[tokio::test]
async fn deferred_publish_completes_on_regack() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;
    subscribe(&h, addr(1), "sensor/#", 1).await;
    h.transport.clear();

    h.gateway.distribute(broker_message("sensor/1", b"21.5")).await;

    // the client has never seen this topic id, so a REGISTER goes out
    // and the publish waits in the pending queue
    let sent = h.transport.sent_to(addr(1));
    assert_eq!(sent.len(), 1);
    let Message::Register(register) = &sent[0] else {
        panic!("expected REGISTER, got {:?}", sent[0]);
    };
    assert_eq!(register.topic, "sensor/1");
    assert_ne!(register.topic_id, 0);
    assert_ne!(register.msg_id, 0);

    let client = h.gateway.clients().get_by_id("gear-001").unwrap();
    assert!(!client.is_registered(register.topic_id));
    assert_eq!(client.pending_len(register.topic_id), 1);

    // client acknowledges the id; the queued publish is released
    h.transport.clear();
    let regack = Message::RegAck(RegAck {
        topic_id: register.topic_id,
        msg_id: register.msg_id,
        code: ReturnCode::Accepted,
    });
    h.gateway.on_packet(&regack.encode(), addr(1)).await;

    let sent = h.transport.sent_to(addr(1));
    assert_eq!(sent.len(), 1);
    let Message::Publish(publish) = &sent[0] else {
        panic!("expected PUBLISH, got {:?}", sent[0]);
    };
    assert_eq!(publish.topic_id, register.topic_id);
    assert_eq!(publish.payload.as_ref(), b"21.5");
    assert_eq!(publish.msg_id, 0);
    // upstream qos 1 clamps to the device-side maximum
    assert_eq!(publish.flags.qos, 0);

    assert!(client.is_registered(register.topic_id));
    assert_eq!(client.pending_len(register.topic_id), 0);
}

#[tokio::test]
async fn registered_client_gets_publish_directly() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;
    subscribe(&h, addr(1), "sensor/1", 1).await;
    h.transport.clear();

    // the concrete subscription already registered the id
    h.gateway.distribute(broker_message("sensor/1", b"42")).await;

    let sent = h.transport.sent_to(addr(1));
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0], Message::Publish(_)));
}

#[tokio::test]
async fn regack_for_unknown_topic_id_is_noop() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;
    h.transport.clear();

    let regack = Message::RegAck(RegAck {
        topic_id: 99,
        msg_id: 1,
        code: ReturnCode::Accepted,
    });
    h.gateway.on_packet(&regack.encode(), addr(1)).await;

    assert!(h.transport.sent_to(addr(1)).is_empty());
}

#[tokio::test]
async fn distribution_fans_out_and_deduplicates() {
    let h = harness();
    connect(&h, "c1", addr(1)).await;
    connect(&h, "c2", addr(2)).await;
    connect(&h, "c3", addr(3)).await;

    subscribe(&h, addr(1), "a/#", 1).await;
    subscribe(&h, addr(1), "a/+", 2).await; // c1 matches twice, counts once
    subscribe(&h, addr(2), "a/b", 3).await;
    subscribe(&h, addr(3), "z", 4).await;
    h.transport.clear();

    h.gateway.distribute(broker_message("a/b", b"x")).await;

    // c1 subscribed via wildcards only: REGISTER. c2's concrete
    // subscription already registered the id: direct PUBLISH.
    assert_eq!(h.transport.sent_to(addr(1)).len(), 1);
    assert!(matches!(
        h.transport.sent_to(addr(1))[0],
        Message::Register(_)
    ));
    assert_eq!(h.transport.sent_to(addr(2)).len(), 1);
    assert!(matches!(
        h.transport.sent_to(addr(2))[0],
        Message::Publish(_)
    ));
    assert!(h.transport.sent_to(addr(3)).is_empty());
}

#[tokio::test]
async fn malformed_broker_topic_is_dropped() {
    let h = harness();
    connect(&h, "c1", addr(1)).await;
    subscribe(&h, addr(1), "#", 1).await;
    h.transport.clear();

    h.gateway.distribute(broker_message("a//b", b"x")).await;

    assert!(h.transport.sent_to(addr(1)).is_empty());
}

#[tokio::test]
async fn reconnect_replaces_session_and_releases_subscriptions() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;
    subscribe(&h, addr(1), "foo", 1).await;

    // same client id from a new address supersedes the old session
    connect(&h, "gear-001", addr(2)).await;

    assert_eq!(h.gateway.clients().len(), 1);
    assert!(h.gateway.clients().get_by_addr(addr(2)).is_some());
    assert!(h.gateway.clients().get_by_addr(addr(1)).is_none());
    assert_eq!(h.broker.unsubscribes.lock().as_slice(), ["foo"]);
    assert!(h.gateway.tree().subscribers_of("foo").unwrap().is_empty());
}

#[tokio::test]
async fn sleeping_disconnect_keeps_session() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;
    subscribe(&h, addr(1), "foo", 1).await;

    h.gateway
        .on_packet(&Message::Disconnect { duration: Some(120) }.encode(), addr(1))
        .await;

    let client = h.gateway.clients().get_by_id("gear-001").unwrap();
    assert!(client.is_asleep());
    assert!(h.broker.unsubscribes.lock().is_empty());
    assert_eq!(h.gateway.tree().subscribers_of("foo").unwrap().len(), 1);
}

#[tokio::test]
async fn garbage_datagrams_are_dropped() {
    let h = harness();
    h.gateway.on_packet(&[], addr(1)).await;
    h.gateway.on_packet(&[0xFF, 0xFF, 0xFF], addr(1)).await;
    h.gateway.on_packet(&[0x02, 0x3F], addr(1)).await; // unknown opcode

    assert!(h.transport.sent_to(addr(1)).is_empty());
    assert!(h.gateway.clients().is_empty());
}

#[tokio::test]
async fn install_distributor_wires_broker_sink() {
    let h = harness();
    connect(&h, "gear-001", addr(1)).await;
    subscribe(&h, addr(1), "sensor/1", 1).await;
    h.transport.clear();

    h.gateway.install_distributor();
    let handler = h.broker.handler.read();
    handler.as_ref().expect("sink installed")(broker_message("sensor/1", b"7"));
    drop(handler);

    // the sink spawns a distribution task; give it a moment
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.transport.sent_to(addr(1)).len(), 1);
}
