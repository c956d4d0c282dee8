/// Configuration for networking and for the `ntables` process.
///
/// [`NetworkConfig`] is the programmatic, builder-style configuration taken
/// by [`Instance::start_server`](crate::Instance::start_server) and
/// [`Instance::start_client`](crate::Instance::start_client).
/// [`AppConfig`] is the JSON file read by the binary at startup; it resolves
/// to a role, a `NetworkConfig`, and an initial topic set.
use crate::error::{TableError, TableResult};
use crate::protocol::DEFAULT_PORT;
use crate::value::{Value, ValueKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which side of the protocol an instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Reconnect schedule for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffPolicy {
    /// Maximum number of attempts (0 means unlimited retries)
    #[serde(default)]
    pub max_retries: usize,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2000
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based): exponential, capped,
    /// plus up to 25% random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_delay_ms);
        let jitter = if base >= 4 {
            rand::thread_rng().gen_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    /// Whether `attempts` failed attempts exhaust the policy.
    pub fn exhausted(&self, attempts: usize) -> bool {
        self.max_retries != 0 && attempts >= self.max_retries
    }
}

/// Network settings for one instance.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address a server binds.
    pub listen_addr: SocketAddr,
    /// Address a client connects to.
    pub server_addr: SocketAddr,
    /// Identity announced in the handshake.
    pub identity: String,
    /// Interval between client pings (default: 1 second).
    pub keepalive_interval: Duration,
    /// Silence after which a peer is dropped (default: 5 seconds).
    pub keepalive_timeout: Duration,
    /// Time allowed for the version exchange (default: 3 seconds).
    pub handshake_timeout: Duration,
    /// Tick of the outbound coalescing buffer when no periodic
    /// subscription asks for something faster (default: 100 ms).
    pub flush_period: Duration,
    /// Client reconnect schedule.
    pub backoff: BackoffPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            identity: "nettables".to_string(),
            keepalive_interval: Duration::from_secs(1),
            keepalive_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(3),
            flush_period: Duration::from_millis(100),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl NetworkConfig {
    /// Create a new network config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address a server binds.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the server a client connects to.
    pub fn server_addr(mut self, addr: SocketAddr) -> Self {
        self.server_addr = addr;
        self
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Set the ping interval and the silence timeout.
    pub fn keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_timeout = timeout;
        self
    }

    pub fn flush_period(mut self, period: Duration) -> Self {
        self.flush_period = period;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Reject settings the network loops cannot run with.
    pub fn validate(&self) -> TableResult<()> {
        if self.keepalive_interval.is_zero() || self.flush_period.is_zero() {
            return Err(TableError::Config(
                "keep-alive interval and flush period must be non-zero".to_string(),
            ));
        }
        if self.keepalive_timeout <= self.keepalive_interval {
            return Err(TableError::Config(format!(
                "keep-alive timeout ({:?}) must exceed the interval ({:?})",
                self.keepalive_timeout, self.keepalive_interval
            )));
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(TableError::Config(
                "backoff base delay exceeds max delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// One topic published at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopicSeed {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ValueKind,
    /// Initial value; `null` publishes without a value.
    #[serde(default)]
    pub value: JsonValue,
    #[serde(default)]
    pub properties: JsonMap<String, JsonValue>,
}

impl TopicSeed {
    /// The initial value, if any.
    pub fn initial_value(&self) -> TableResult<Option<Value>> {
        if self.value.is_null() {
            return Ok(None);
        }
        Value::from_json(self.kind, &self.value, 0).map(Some)
    }
}

/// The `ntables` configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub role: Role,
    /// Host name or address of the server (clients).
    #[serde(default)]
    pub server: Option<String>,
    /// Team number; resolves to `10.TE.AM.2` when `server` is unset.
    #[serde(default)]
    pub team: Option<u16>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address a server binds.
    #[serde(default = "default_listen")]
    pub listen: IpAddr,
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Where persistent topics are saved (servers).
    #[serde(default)]
    pub persist_file: Option<PathBuf>,
    /// Autosave interval in seconds; 0 disables autosave.
    #[serde(default = "default_autosave_secs")]
    pub autosave_secs: u64,
    #[serde(default)]
    pub keepalive_interval_ms: Option<u64>,
    #[serde(default)]
    pub keepalive_timeout_ms: Option<u64>,
    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,
    #[serde(default)]
    pub topics: Vec<TopicSeed>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_listen() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_identity() -> String {
    "ntables".to_string()
}

fn default_autosave_secs() -> u64 {
    1
}

impl AppConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> TableResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TableError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// Parse and validate config text.
    pub fn from_json_str(text: &str) -> TableResult<Self> {
        let config: AppConfig = serde_json::from_str(text)
            .map_err(|e| TableError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> TableResult<()> {
        if self.role == Role::Client && self.server.is_none() && self.team.is_none() {
            return Err(TableError::Config(
                "client role needs `server` or `team`".to_string(),
            ));
        }
        if let Some(team) = self.team {
            if team > 25599 {
                return Err(TableError::Config(format!("team number {} out of range", team)));
            }
        }
        for seed in &self.topics {
            if seed.name.is_empty() {
                return Err(TableError::Config("topic with empty name".to_string()));
            }
            if seed.kind == ValueKind::Unassigned {
                return Err(TableError::Config(format!(
                    "topic '{}' has no type",
                    seed.name
                )));
            }
            seed.initial_value().map_err(|e| {
                TableError::Config(format!("topic '{}': {}", seed.name, e))
            })?;
        }
        self.network_config().validate()
    }

    /// Host the client connects to: `server`, else the team address.
    pub fn server_host(&self) -> Option<String> {
        if let Some(server) = &self.server {
            return Some(server.clone());
        }
        self.team.map(team_address)
    }

    /// Resolve the server host and port to a socket address.
    pub fn server_addr(&self) -> TableResult<SocketAddr> {
        let host = self
            .server_host()
            .ok_or_else(|| TableError::Config("no server configured".to_string()))?;
        (host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| TableError::Config(format!("cannot resolve {}: {}", host, e)))?
            .next()
            .ok_or_else(|| TableError::Config(format!("no address for {}", host)))
    }

    /// Network settings described by this file.
    ///
    /// The server address is left at its default when it cannot be resolved
    /// yet; [`AppConfig::server_addr`] reports that error.
    pub fn network_config(&self) -> NetworkConfig {
        let mut config = NetworkConfig::new()
            .listen_addr(SocketAddr::new(self.listen, self.port))
            .identity(self.identity.clone());
        if let Ok(addr) = self.server_addr() {
            config = config.server_addr(addr);
        }
        if let Some(ms) = self.keepalive_interval_ms {
            config.keepalive_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.keepalive_timeout_ms {
            config.keepalive_timeout = Duration::from_millis(ms);
        }
        if let Some(backoff) = self.backoff {
            config.backoff = backoff;
        }
        config
    }

    /// Autosave interval, `None` when disabled.
    pub fn autosave_interval(&self) -> Option<Duration> {
        (self.autosave_secs > 0).then(|| Duration::from_secs(self.autosave_secs))
    }
}

/// The conventional robot address for a team number: `10.TE.AM.2`.
pub fn team_address(team: u16) -> String {
    format!("10.{}.{}.2", team / 100, team % 100)
}
