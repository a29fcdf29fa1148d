//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `WEBTUNNEL_LISTEN`, `PORT`,
//!    `WEBTUNNEL_RELAY_URL`, `WEBTUNNEL_LOCAL_URL`, `WEBTUNNEL_PUBLIC_HOST`
//! 2. **Config file**: path via `--config <path>`, or `webtunnel.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [relay]
//! listen = "0.0.0.0:3000"
//! prefix = "/proxy"
//! request_timeout_secs = 30
//! max_body_bytes = 10485760  # 10 MB
//! agent_timeout_secs = 90    # 0 disables the dead-agent sweep
//! public_host = "tunnel.example.com"
//! server_name = "webtunnel"
//! static_dir = "public"
//!
//! [agent]
//! relay_url = "wss://tunnel.example.com/ws"
//! local_url = "http://localhost:8100"
//! reconnect_delay_secs = 5
//! heartbeat_interval_secs = 25
//! local_timeout_secs = 30
//! preserve_host = true
//! health_listen = "127.0.0.1:9090"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Name of the config file picked up from the working directory.
const DEFAULT_CONFIG_FILE: &str = "webtunnel.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay (public side) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Socket address to bind (default `0.0.0.0:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Path prefix under which the agent's application is exposed (default `/proxy`).
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Seconds to wait for the agent's response envelope (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Maximum inbound request body in bytes (default 10 MB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Evict agents with no heartbeat for this many seconds (default 90, 0 = never).
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,
    /// Hostname written into rewritten cookie `Domain` attributes. When unset,
    /// `Domain` is dropped and cookies become host-only on the relay's origin.
    pub public_host: Option<String>,
    /// Server name announced in the `welcome` envelope.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Directory holding `index.html`, `status.html` and other static assets.
    pub static_dir: Option<String>,
}

/// Agent (private side) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Duplex endpoint of the relay (e.g. `wss://tunnel.example.com/ws`).
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Base URL of the local application requests are executed against.
    #[serde(default = "default_local_url")]
    pub local_url: String,
    /// Fixed delay between reconnect attempts (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Seconds between heartbeat envelopes (default 25).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Timeout for a single call to the local application (default 30).
    #[serde(default = "default_local_timeout")]
    pub local_timeout_secs: u64,
    /// Present the relay's public host as `Host` to the local app (default true).
    #[serde(default = "default_preserve_host")]
    pub preserve_host: bool,
    /// Optional bind address for the agent's own liveness endpoint.
    pub health_listen: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Failure to read or parse the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_prefix() -> String {
    "/proxy".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10 MB
}
fn default_agent_timeout() -> u64 {
    90
}
fn default_server_name() -> String {
    "webtunnel".to_string()
}
fn default_relay_url() -> String {
    "ws://127.0.0.1:3000/ws".to_string()
}
fn default_local_url() -> String {
    "http://localhost:8100".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_heartbeat_interval() -> u64 {
    25
}
fn default_local_timeout() -> u64 {
    30
}
fn default_preserve_host() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            prefix: default_prefix(),
            request_timeout_secs: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
            agent_timeout_secs: default_agent_timeout(),
            public_host: None,
            server_name: default_server_name(),
            static_dir: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            local_url: default_local_url(),
            reconnect_delay_secs: default_reconnect_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            local_timeout_secs: default_local_timeout(),
            preserve_host: default_preserve_host(),
            health_listen: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `webtunnel.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.relay.prefix = normalize_prefix(&config.relay.prefix);
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply env var overrides through `lookup` (injectable for tests).
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT") {
            self.relay.listen = format!("0.0.0.0:{port}");
        }
        if let Some(listen) = lookup("WEBTUNNEL_LISTEN") {
            self.relay.listen = listen;
        }
        if let Some(host) = lookup("WEBTUNNEL_PUBLIC_HOST") {
            self.relay.public_host = Some(host);
        }
        if let Some(url) = lookup("WEBTUNNEL_RELAY_URL") {
            self.agent.relay_url = url;
        }
        if let Some(url) = lookup("WEBTUNNEL_LOCAL_URL") {
            self.agent.local_url = url;
        }
    }
}

/// Force a leading slash and strip trailing ones: `proxy/` → `/proxy`.
/// The tunnel cannot own the root path, so an empty prefix falls back to the default.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        default_prefix()
    } else {
        format!("/{trimmed}")
    }
}
