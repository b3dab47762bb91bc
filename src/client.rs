//! Per-client session state and the serialized southbound send path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::error::Result;
use crate::protocol::Message;

/// Send-capable handle for the datagram return path.
///
/// The production implementation is the gateway's UDP socket; tests
/// substitute a recording fake.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> std::io::Result<usize>;
}

#[async_trait]
impl Transport for UdpSocket {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        UdpSocket::send_to(self, buf, addr).await
    }
}

/// A connected datagram client.
///
/// The registry owns the authoritative `Arc`; topic-tree nodes hold cheap
/// clones that the registry sweeps when the session ends.
pub struct Client {
    client_id: Arc<str>,
    addr: SocketAddr,
    conn: Arc<dyn Transport>,
    state: Mutex<SessionState>,
    /// Serializes datagram writes so parallel fan-out tasks cannot
    /// interleave messages on the same return address.
    send_lock: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct SessionState {
    /// Topic ids this client has acknowledged (REGACK'd or subscribed).
    registered: HashSet<u16>,
    /// Publishes queued per topic id until the client acknowledges the id.
    pending: HashMap<u16, VecDeque<Message>>,
    /// Set by DISCONNECT with a sleep duration.
    asleep: bool,
    /// Will flag from CONNECT; the will exchange itself is not driven.
    will: bool,
}

impl Client {
    pub fn new(client_id: &str, addr: SocketAddr, conn: Arc<dyn Transport>) -> Self {
        Self {
            client_id: Arc::from(client_id),
            addr,
            conn,
            state: Mutex::new(SessionState::default()),
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn id_arc(&self) -> Arc<str> {
        Arc::clone(&self.client_id)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether this client has been told about `topic_id`.
    pub fn is_registered(&self, topic_id: u16) -> bool {
        self.state.lock().registered.contains(&topic_id)
    }

    pub fn mark_registered(&self, topic_id: u16) {
        self.state.lock().registered.insert(topic_id);
    }

    /// Queue a publish for `topic_id` until the client acknowledges the id.
    pub fn enqueue_pending(&self, topic_id: u16, msg: Message) {
        self.state
            .lock()
            .pending
            .entry(topic_id)
            .or_default()
            .push_back(msg);
    }

    /// Take all queued publishes for `topic_id`, oldest first.
    pub fn drain_pending(&self, topic_id: u16) -> Vec<Message> {
        self.state
            .lock()
            .pending
            .remove(&topic_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Number of publishes queued for `topic_id`.
    pub fn pending_len(&self, topic_id: u16) -> usize {
        self.state
            .lock()
            .pending
            .get(&topic_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn set_asleep(&self, asleep: bool) {
        self.state.lock().asleep = asleep;
    }

    pub fn is_asleep(&self) -> bool {
        self.state.lock().asleep
    }

    pub fn set_will(&self, will: bool) {
        self.state.lock().will = will;
    }

    pub fn has_will(&self) -> bool {
        self.state.lock().will
    }

    /// Encode and transmit a message on the client's return path.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let buf = msg.encode();
        let _guard = self.send_lock.lock().await;
        trace!(client = %self.client_id, kind = %msg.msg_type(), "sending datagram");
        self.conn.send_to(&buf, self.addr).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.client_id)
            .field("addr", &self.addr)
            .finish()
    }
}
