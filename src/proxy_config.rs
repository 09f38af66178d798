//! Configuration for the proxy server

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::flow_store::{DEFAULT_FLOW_CAPACITY, DEFAULT_SUBSCRIBER_QUEUE};
use crate::http_codec::DEFAULT_MAX_BODY_BYTES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyOptions {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// When false, `CONNECT` becomes a blind byte-forwarding tunnel: no TLS
    /// termination and no inner flows.
    #[serde(default = "default_true")]
    pub intercept_https: bool,

    /// Whether the logger port is called for each captured flow.
    #[serde(default = "default_true")]
    pub enable_logging: bool,

    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,

    /// Idle read timeout per connection, in seconds. Also bounds the first
    /// request read and TLS handshakes.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Parser ceiling for message bodies, in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Retention bound of the flow store.
    #[serde(default = "default_flow_capacity")]
    pub flow_capacity: usize,

    /// Per-subscriber event queue length; slower subscribers drop events.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,

    #[serde(default)]
    pub tls: TlsOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Directory holding the sealed CA container.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Verify origins against the platform's root certificates.
    #[serde(default = "default_true")]
    pub use_system_roots: bool,

    /// Extra PEM files trusted for origin verification, e.g. private CAs.
    #[serde(default)]
    pub extra_origin_roots: Vec<PathBuf>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            intercept_https: true,
            enable_logging: true,
            max_concurrent_connections: default_max_concurrent_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            flow_capacity: default_flow_capacity(),
            subscriber_queue: default_subscriber_queue(),
            tls: TlsOptions::default(),
        }
    }
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            use_system_roots: true,
            extra_origin_roots: vec![],
        }
    }
}

impl ProxyOptions {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .context("Failed to read configuration file")?;
        let options: ProxyOptions =
            toml::from_str(&contents).context("Failed to parse configuration file")?;
        Ok(options)
    }

    /// Load configuration from environment variables or use defaults
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(addr) = std::env::var("SNITCHER_PROXY_ADDR") {
            if let Ok(ip) = addr.parse() {
                options.listen_addr = ip;
            }
        }

        if let Ok(port) = std::env::var("SNITCHER_PROXY_PORT") {
            if let Ok(p) = port.parse() {
                options.listen_port = p;
            }
        }

        if let Ok(dir) = std::env::var("SNITCHER_PROXY_STATE_DIR") {
            options.tls.state_dir = PathBuf::from(dir);
        }

        if let Ok(v) = std::env::var("SNITCHER_PROXY_INTERCEPT") {
            options.intercept_https = v != "0" && !v.eq_ignore_ascii_case("false");
        }

        options
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path.as_ref(), contents).context("Failed to write configuration file")?;
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }
}

fn default_listen_addr() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn default_listen_port() -> u16 {
    8899
}

fn default_max_concurrent_connections() -> usize {
    256
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_flow_capacity() -> usize {
    DEFAULT_FLOW_CAPACITY
}

fn default_subscriber_queue() -> usize {
    DEFAULT_SUBSCRIBER_QUEUE
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".snitcher-proxy")
}

fn default_true() -> bool {
    true
}
