use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::anticheat::mods::ModPolicy;
use crate::anticheat::penalty::{Check, CheckPolicy, Penalty, PenaltyRule};
use crate::net::protocol::GameVersion;

/// Configuration file looked up when `CONFIG_PATH` is unset
const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Longest ban a check may hand out, ten years
pub const MAX_BAN_DURATION_SECS: u64 = 10 * 365 * 86_400;

/// Process-wide configuration, immutable after load
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Name announced in the modded handshake reply
    pub server_name: String,
    /// Version announced in the modded handshake reply
    pub server_version: String,
    /// Mod handshake extension (`false`, `true`, or a mod policy)
    pub reactor: ReactorSetting,
    pub anticheat: AnticheatConfig,
    /// Endpoint of this worker node
    pub node: NodeEndpoint,
    /// Load balancer endpoint and its worker pool
    pub master: MasterConfig,
    pub ledger: LedgerConfig,
}

/// `host:port` pair of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl NodeEndpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl std::fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MasterConfig {
    pub ip: IpAddr,
    pub port: u16,
    /// Workers the load balancer redirects to
    pub nodes: Vec<NodeEndpoint>,
}

impl MasterConfig {
    pub fn endpoint(&self) -> NodeEndpoint {
        NodeEndpoint::new(self.ip, self.port)
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 22023,
            nodes: vec![NodeEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 22123)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// In-process store, shared only by nodes of the same process
    Memory,
    /// Redis server shared by every process of the fleet
    Redis,
}

impl LedgerBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerBackend::Memory => "memory",
            LedgerBackend::Redis => "redis",
        }
    }

    /// Whether nodes in other processes see the same data
    pub fn is_shared(&self) -> bool {
        matches!(self, LedgerBackend::Redis)
    }
}

impl FromStr for LedgerBackend {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(LedgerBackend::Memory),
            "redis" => Ok(LedgerBackend::Redis),
            other => Err(ConfigError::Invalid(format!("Unknown ledger backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    /// Address of a networked backend
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Load balancer wipes stale proofs and counters on startup
    pub flush_on_start: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Memory,
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            flush_on_start: true,
        }
    }
}

/// `reactor` accepts a boolean or a full mod policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReactorSetting {
    Toggle(bool),
    Policy(ModPolicy),
}

impl ReactorSetting {
    pub fn enabled(&self) -> bool {
        !matches!(self, ReactorSetting::Toggle(false))
    }

    pub fn policy(&self) -> Option<&ModPolicy> {
        match self {
            ReactorSetting::Policy(policy) => Some(policy),
            ReactorSetting::Toggle(_) => None,
        }
    }
}

/// Anticheat settings: admission limits plus one policy per named check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnticheatConfig {
    /// Client versions allowed to identify
    pub versions: Vec<GameVersion>,
    /// Ban refusal text, `%s` is replaced by the remaining duration
    pub ban_message: String,
    /// Fleet-wide connections per IP (0 disables the limit)
    pub max_connections_per_ip: u32,
    pub check_settings: CheckPolicy,
    pub check_object_ownership: CheckPolicy,
    pub host_checks: CheckPolicy,
    pub malformed_packets: CheckPolicy,
    pub massive_packets: CheckPolicy,
}

impl AnticheatConfig {
    pub fn policy(&self, check: Check) -> &CheckPolicy {
        match check {
            Check::CheckSettings => &self.check_settings,
            Check::CheckObjectOwnership => &self.check_object_ownership,
            Check::HostChecks => &self.host_checks,
            Check::MalformedPackets => &self.malformed_packets,
            Check::MassivePackets => &self.massive_packets,
        }
    }
}

impl Default for AnticheatConfig {
    fn default() -> Self {
        Self {
            versions: vec![GameVersion::new(2020, 4, 2, 0)],
            ban_message: "You were banned for %s for hacking.".to_string(),
            max_connections_per_ip: 2,
            check_settings: CheckPolicy::Toggle(true),
            check_object_ownership: CheckPolicy::Toggle(true),
            host_checks: CheckPolicy::Toggle(true),
            malformed_packets: CheckPolicy::Toggle(false),
            massive_packets: CheckPolicy::Rule(PenaltyRule {
                penalty: Some(Penalty::Disconnect),
                strikes: Some(3),
                ban_duration: None,
            }),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "Fleet Gateway".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            reactor: ReactorSetting::Toggle(false),
            anticheat: AnticheatConfig::default(),
            node: NodeEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 22123),
            master: MasterConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ServerConfig {
    /// Load config from file and environment or use defaults
    pub fn load_or_default() -> Self {
        let path = std::env::var("CONFIG_PATH").ok();
        let explicit = path.is_some();
        let path = path.unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

        let mut config = if explicit || Path::new(&path).exists() {
            match Self::from_file(&path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Could not load config '{}': {}, using defaults", path, e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.apply_env();
        config
    }

    /// Read a JSON config file and deep-merge it over the defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Deep-merge a JSON document over the defaults
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let overlay: Value = serde_json::from_str(raw)?;
        let mut merged = serde_json::to_value(Self::default())?;
        merge(&mut merged, overlay);
        Ok(serde_json::from_value(merged)?)
    }

    fn apply_env(&mut self) {
        if let Ok(ip) = std::env::var("NODE_IP") {
            match ip.parse() {
                Ok(parsed) => self.node.ip = parsed,
                Err(_) => tracing::warn!("Invalid NODE_IP '{}', using default", ip),
            }
        }

        if let Ok(port) = std::env::var("NODE_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) if parsed > 0 => self.node.port = parsed,
                _ => tracing::warn!("Invalid NODE_PORT '{}', using default", port),
            }
        }

        if let Ok(ip) = std::env::var("MASTER_IP") {
            match ip.parse() {
                Ok(parsed) => self.master.ip = parsed,
                Err(_) => tracing::warn!("Invalid MASTER_IP '{}', using default", ip),
            }
        }

        if let Ok(port) = std::env::var("MASTER_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) if parsed > 0 => self.master.port = parsed,
                _ => tracing::warn!("Invalid MASTER_PORT '{}', using default", port),
            }
        }

        if let Ok(max) = std::env::var("MAX_CONNECTIONS_PER_IP") {
            match max.parse::<u32>() {
                Ok(parsed) => self.anticheat.max_connections_per_ip = parsed,
                Err(_) => tracing::warn!("Invalid MAX_CONNECTIONS_PER_IP '{}', using default", max),
            }
        }

        if let Ok(backend) = std::env::var("LEDGER_BACKEND") {
            match backend.parse::<LedgerBackend>() {
                Ok(parsed) => self.ledger.backend = parsed,
                Err(e) => tracing::warn!("{}, using default", e),
            }
        }

        if let Ok(host) = std::env::var("LEDGER_HOST") {
            self.ledger.host = host;
        }

        if let Ok(port) = std::env::var("LEDGER_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) if parsed > 0 => self.ledger.port = parsed,
                _ => tracing::warn!("Invalid LEDGER_PORT '{}', using default", port),
            }
        }

        if let Ok(password) = std::env::var("LEDGER_PASSWORD") {
            self.ledger.password = Some(password).filter(|p| !p.is_empty());
        }
    }

    /// Refuse a ledger that other processes cannot see
    ///
    /// Required whenever the load balancer and its workers run as separate processes.
    pub fn require_shared_ledger(&self) -> Result<(), ConfigError> {
        if !self.ledger.backend.is_shared() {
            return Err(ConfigError::Invalid(format!(
                "ledger.backend '{}' is local to one process, master and worker modes need 'redis'",
                self.ledger.backend.as_str()
            )));
        }
        Ok(())
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.port == 0 || self.master.port == 0 {
            return Err(ConfigError::Invalid("Port cannot be 0".to_string()));
        }
        if self.master.nodes.is_empty() {
            return Err(ConfigError::Invalid(
                "master.nodes must list at least one worker".to_string(),
            ));
        }
        if self.master.nodes.iter().any(|node| node.port == 0) {
            return Err(ConfigError::Invalid("Worker port cannot be 0".to_string()));
        }
        if self.anticheat.versions.is_empty() {
            return Err(ConfigError::Invalid(
                "anticheat.versions must allow at least one version".to_string(),
            ));
        }
        for check in Check::ALL {
            let too_long = self
                .anticheat
                .policy(check)
                .rule()
                .and_then(|rule| rule.ban_duration)
                .is_some_and(|secs| secs > MAX_BAN_DURATION_SECS);
            if too_long {
                return Err(ConfigError::Invalid(format!(
                    "anticheat.{}.banDuration cannot exceed {} seconds",
                    check.as_str(),
                    MAX_BAN_DURATION_SECS
                )));
            }
        }
        if self.ledger.backend.is_shared() && (self.ledger.host.is_empty() || self.ledger.port == 0) {
            return Err(ConfigError::Invalid(
                "ledger.host and ledger.port are required for a networked backend".to_string(),
            ));
        }
        Ok(())
    }
}

/// Recursively merge `overlay` into `base`; non-object values replace
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
