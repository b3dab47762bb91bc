//! Aggregating MQTT-SN gateway.
//!
//! Bridges constrained clients speaking compact MQTT-SN datagrams over UDP
//! to an upstream broker speaking full MQTT. Topics cross the datagram
//! wire as 16-bit ids; the gateway owns the id ↔ string registry and
//! aggregates subscriptions, so N local subscribers of a topic cost a
//! single upstream subscription.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sngate::{BrokerLink, Gateway, GatewayConfig, RumqttcLink, Transport};
//! use tokio::net::UdpSocket;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::default();
//!     let broker = Arc::new(RumqttcLink::new(&config)?);
//!     broker.connect().await?;
//!
//!     let socket = Arc::new(UdpSocket::bind(("0.0.0.0", config.port)).await?);
//!     let gateway = Gateway::new(broker, Arc::clone(&socket) as Arc<dyn Transport>);
//!     gateway.install_distributor();
//!
//!     let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!     sngate::udp::serve(gateway, socket, shutdown_rx).await?;
//!     Ok(())
//! }
//! ```

mod broker;
mod client;
mod config;
mod error;
mod gateway;
mod index;
pub mod protocol;
mod registry;
#[cfg(test)]
mod tests;
mod tree;
mod types;
pub mod udp;

pub use broker::{BrokerLink, BrokerMessage, MessageHandler, RumqttcLink};
pub use client::{Client, Transport};
pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use gateway::Gateway;
pub use index::TopicIndex;
pub use registry::ClientRegistry;
pub use tree::{RemoveOutcome, SubscribeOutcome, TopicTree};
pub use types::QoS;
