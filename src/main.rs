//! sngated - aggregating MQTT-SN gateway daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};

use sngate::{udp, BrokerLink, Gateway, GatewayConfig, RumqttcLink, Transport};

/// Aggregating MQTT-SN gateway.
#[derive(Parser, Debug)]
#[command(name = "sngated")]
#[command(about = "Bridges MQTT-SN datagram clients to an upstream MQTT broker")]
struct Args {
    /// Config file (JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP port for the datagram side
    #[arg(short, long)]
    port: Option<u16>,

    /// Upstream broker URL, e.g. mqtt://127.0.0.1:1883
    #[arg(short, long)]
    broker: Option<String>,

    /// Broker username
    #[arg(long)]
    user: Option<String>,

    /// Broker password
    #[arg(long)]
    password: Option<String>,

    /// Client id for the broker connection
    #[arg(long)]
    client_id: Option<String>,

    /// Upstream operation timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::load(path)?,
            None => GatewayConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(broker) = self.broker {
            config.broker_url = broker;
        }
        if self.user.is_some() {
            config.mqtt_user = self.user;
        }
        if self.password.is_some() {
            config.mqtt_password = self.password;
        }
        if self.client_id.is_some() {
            config.mqtt_client_id = self.client_id;
        }
        if let Some(timeout) = self.timeout {
            config.mqtt_timeout = timeout;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = args.into_config()?;

    info!("aggregating gateway starting");
    let broker = Arc::new(RumqttcLink::new(&config)?);
    if let Err(e) = broker.connect().await {
        error!(url = %config.broker_url, error = %e, "failed to connect to upstream broker");
        std::process::exit(1);
    }
    info!(url = %config.broker_url, "connected to upstream broker");

    let socket = Arc::new(UdpSocket::bind(("0.0.0.0", config.port)).await?);
    let gateway = Gateway::new(
        Arc::clone(&broker) as Arc<dyn BrokerLink>,
        Arc::clone(&socket) as Arc<dyn Transport>,
    );
    gateway.install_distributor();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let listener = tokio::spawn(udp::serve(gateway, socket, shutdown_rx));
    info!(port = config.port, "aggregating gateway started");

    tokio::signal::ctrl_c().await?;
    info!("aggregating gateway stopping");

    let _ = shutdown_tx.send(());
    if let Err(e) = broker.disconnect().await {
        warn!(error = %e, "broker disconnect failed");
    }
    // give the broker time to process the DISCONNECT
    tokio::time::sleep(Duration::from_millis(500)).await;
    let _ = listener.await;

    info!("aggregating gateway stopped");
    Ok(())
}
