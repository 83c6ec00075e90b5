use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::DEFAULT_ITERATIONS;
use crate::error::{Error, Result};

const DEFAULT_ENDPOINT: &str = "ws";
const DEFAULT_PING_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 5_000;
const DEFAULT_DIAL_TIMEOUT_MS: u64 = 5_000;

/// Client configuration, read from a `config.json` of the form
/// `{"addr": "host:port", "keystore": "path", "endpoint": "ws"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// `host:port` of the relay.
    pub addr: String,
    /// Path to the sealed keystore file.
    #[serde(default)]
    pub keystore: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Relays are commonly deployed with self-signed certificates.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_true() -> bool {
    true
}

fn default_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

fn default_ping_interval_ms() -> u64 {
    DEFAULT_PING_INTERVAL_MS
}

fn default_reconnect_backoff_ms() -> u64 {
    DEFAULT_RECONNECT_BACKOFF_MS
}

fn default_dial_timeout_ms() -> u64 {
    DEFAULT_DIAL_TIMEOUT_MS
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            keystore: String::new(),
            endpoint: default_endpoint(),
            tls: true,
            accept_invalid_certs: true,
            iterations: DEFAULT_ITERATIONS,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Apply `WSCHAT_SERVER_ADDR` and `WSCHAT_KEYSTORE` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("WSCHAT_SERVER_ADDR") {
            info!(addr = %addr, "Relay address overridden from environment");
            self.addr = addr;
        }
        if let Ok(keystore) = std::env::var("WSCHAT_KEYSTORE") {
            self.keystore = keystore;
        }
        self
    }

    fn validate(&self) -> Result<()> {
        if self.addr.trim().is_empty() {
            return Err(Error::Config("addr must not be empty".to_string()));
        }
        if self.ping_interval_ms == 0 {
            return Err(Error::Config("pingIntervalMs must be positive".to_string()));
        }
        Ok(())
    }

    /// Websocket URL of the relay endpoint.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!(
            "{}://{}/{}",
            scheme,
            self.addr,
            self.endpoint.trim_start_matches('/')
        )
    }

    /// Never zero, whatever the field holds.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}
