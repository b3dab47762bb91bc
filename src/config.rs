//! Gateway configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

fn default_port() -> u16 {
    1884
}

fn default_broker_url() -> String {
    "mqtt://127.0.0.1:1883".to_string()
}

fn default_timeout() -> u64 {
    10
}

/// Configuration for the gateway, loadable from a JSON or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// UDP port for the datagram side.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upstream broker address, `mqtt://[user:pass@]host:port`.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Broker username; omitted means no credential sent.
    #[serde(default)]
    pub mqtt_user: Option<String>,
    /// Broker password.
    #[serde(default)]
    pub mqtt_password: Option<String>,
    /// Client id used on the broker connection.
    #[serde(default)]
    pub mqtt_client_id: Option<String>,
    /// Upstream operation timeout in seconds.
    #[serde(default = "default_timeout")]
    pub mqtt_timeout: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            broker_url: default_broker_url(),
            mqtt_user: None,
            mqtt_password: None,
            mqtt_client_id: None,
            mqtt_timeout: default_timeout(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON or YAML file, by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let config: Self = match ext {
            "json" => serde_json::from_slice(&data)
                .map_err(|e| Error::InvalidConfig(e.to_string()))?,
            "yaml" | "yml" => serde_yaml::from_slice(&data)
                .map_err(|e| Error::InvalidConfig(e.to_string()))?,
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unsupported config extension: {:?}",
                    other
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.broker_url)
            .map_err(|e| Error::InvalidConfig(format!("broker url: {}", e)))?;
        if self.mqtt_timeout == 0 {
            return Err(Error::InvalidConfig("mqtt_timeout must be positive".to_string()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt_timeout)
    }
}
