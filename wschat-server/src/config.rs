use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use wschat_core::{Error, Result};

use crate::connection::{ConnectionSettings, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_LIVENESS_WINDOW};
use crate::registry::DEFAULT_MAX_PENDING;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8443";
const DEFAULT_ENDPOINT: &str = "ws";

/// Relay configuration.
///
/// Built from defaults, then an optional JSON file named by `WSCHAT_CONFIG`,
/// then individual `WSCHAT_*` variables, each layer overriding the last.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// URL path segment clients must upgrade on, without slashes
    pub endpoint: String,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub allowed_ids: Option<HashSet<String>>,
    pub liveness_window: Duration,
    pub handshake_timeout: Duration,
    pub max_pending: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            cert_file: None,
            key_file: None,
            allowed_ids: None,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// On-disk layout of the optional config file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileConfig {
    port: u16,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    cert_file: Option<String>,
    #[serde(default)]
    key_file: Option<String>,
    #[serde(default)]
    users: Vec<String>,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self> {
        let base = match std::env::var("WSCHAT_CONFIG") {
            Ok(path) if !path.is_empty() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        base.apply_env(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: FileConfig = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid config file: {}", e)))?;

        let mut config = Self {
            listen_addr: format!("0.0.0.0:{}", file.port),
            ..Self::default()
        };
        if let Some(endpoint) = file.endpoint {
            config.endpoint = normalize_endpoint(&endpoint);
        }
        config.cert_file = non_empty(file.cert_file).map(PathBuf::from);
        config.key_file = non_empty(file.key_file).map(PathBuf::from);
        if !file.users.is_empty() {
            config.allowed_ids = Some(file.users.into_iter().collect());
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply `WSCHAT_*` overrides read through `var`.
    pub fn apply_env<F>(mut self, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = non_empty(var("WSCHAT_LISTEN_ADDR")) {
            self.listen_addr = addr;
        }
        if let Some(endpoint) = var("WSCHAT_ENDPOINT") {
            self.endpoint = normalize_endpoint(&endpoint);
        }
        if let Some(cert) = non_empty(var("WSCHAT_TLS_CERT")) {
            self.cert_file = Some(PathBuf::from(cert));
        }
        if let Some(key) = non_empty(var("WSCHAT_TLS_KEY")) {
            self.key_file = Some(PathBuf::from(key));
        }
        if let Some(ids) = var("WSCHAT_ALLOWED_IDS") {
            let ids: HashSet<String> = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect();
            self.allowed_ids = if ids.is_empty() { None } else { Some(ids) };
        }
        if let Some(secs) = var("WSCHAT_LIVENESS_SECS") {
            self.liveness_window = Duration::from_secs(parse_number("WSCHAT_LIVENESS_SECS", &secs)?);
        }
        if let Some(secs) = var("WSCHAT_HANDSHAKE_TIMEOUT_SECS") {
            self.handshake_timeout =
                Duration::from_secs(parse_number("WSCHAT_HANDSHAKE_TIMEOUT_SECS", &secs)?);
        }
        if let Some(max) = var("WSCHAT_MAX_PENDING") {
            self.max_pending = parse_number("WSCHAT_MAX_PENDING", &max)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Certificate and key paths, when both are configured.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            liveness_window: self.liveness_window,
            handshake_timeout: self.handshake_timeout,
            allowed_ids: self.allowed_ids.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(Error::Config(
                "TLS needs both a certificate and a key".to_string(),
            ));
        }
        if self.liveness_window.is_zero() {
            return Err(Error::Config("liveness window must be positive".to_string()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::Config("handshake timeout must be positive".to_string()));
        }
        if self.max_pending == 0 {
            return Err(Error::Config("max pending must be positive".to_string()));
        }
        Ok(())
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    endpoint.trim().trim_matches('/').to_string()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a positive integer, got {:?}", key, value)))
}
