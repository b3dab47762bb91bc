//! Southbound UDP listener.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::Result;
use crate::gateway::Gateway;

/// Largest datagram the gateway accepts.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Receive datagrams until the shutdown channel fires.
///
/// Datagrams are dispatched inline, which keeps packets from a single
/// remote address in arrival order.
pub async fn serve(
    gateway: Arc<Gateway>,
    socket: Arc<UdpSocket>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    if let Ok(addr) = socket.local_addr() {
        info!(%addr, "listening for datagrams");
    }

    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("datagram listener stopping");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => {
                let (n, addr) = received?;
                debug!(%addr, bytes = n, "datagram");
                gateway.on_packet(&buf[..n], addr).await;
            }
        }
    }
}
