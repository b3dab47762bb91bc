//! Registry of connected client sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::client::Client;

/// Owns every live session, indexed by client id and by datagram return
/// address.
pub struct ClientRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<Arc<str>, Arc<Client>>,
    by_addr: HashMap<SocketAddr, Arc<Client>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Insert a session. A session with the same client id is replaced and
    /// returned so the caller can tear it down.
    pub fn add(&self, client: Arc<Client>) -> Option<Arc<Client>> {
        let mut inner = self.inner.write();
        let replaced = inner.by_id.insert(client.id_arc(), Arc::clone(&client));
        if let Some(old) = &replaced {
            inner.by_addr.remove(&old.addr());
        }
        inner.by_addr.insert(client.addr(), client);
        replaced
    }

    pub fn get_by_id(&self, client_id: &str) -> Option<Arc<Client>> {
        self.inner.read().by_id.get(client_id).cloned()
    }

    pub fn get_by_addr(&self, addr: SocketAddr) -> Option<Arc<Client>> {
        self.inner.read().by_addr.get(&addr).cloned()
    }

    /// Drop the session for `client_id` from both indexes.
    pub fn remove(&self, client_id: &str) -> Option<Arc<Client>> {
        let mut inner = self.inner.write();
        let client = inner.by_id.remove(client_id)?;
        inner.by_addr.remove(&client.addr());
        Some(client)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }
}
