//! Configuration for an Abacus node.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $ABACUS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/abacus/config.toml
//!   3. ~/.config/abacus/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::DEFAULT_PEER_PORT;

/// Largest node id a contest fleet can use.
pub const MAX_NODE_ID: u32 = 16;

/// Bounds on `messenger.max_fragment_size`.
pub const MIN_FRAGMENT_SIZE: usize = 64;
pub const MAX_FRAGMENT_SIZE: usize = 60_000;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbacusConfig {
    pub node: NodeConfig,
    pub messenger: MessengerConfig,
    pub resend: ResendConfig,
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's id, 1..=16. Also the high bits of every local id range.
    pub id: u32,
    /// Human-readable name for logs.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Transport kind: "udp" or "udtcp".
    pub kind: String,
    /// Local address to bind both sockets to.
    pub bind: String,
    /// UDP port for peer datagrams.
    pub port: u16,
    /// TCP port for large blobs (udtcp only). 0 = same as `port`.
    pub tcp_port: u16,
    /// Cipher name: chacha20-poly1305, aes-256-gcm, aes-128-gcm.
    pub cipher: String,
    pub key_file: PathBuf,
    pub iv_file: PathBuf,
    /// Seed for the frame checksum. Every node must agree.
    pub checksum_seed: u32,
    /// Inter-fragment backoff bounds, microseconds.
    pub min_delay_us: u32,
    pub max_delay_us: u32,
    pub init_delay_us: u32,
    /// Largest fragment payload in one datagram.
    pub max_fragment_size: usize,
    /// Blobs above this size go over TCP (udtcp only).
    pub inline_limit: usize,
    /// Partial reassemblies older than this are dropped.
    pub reassembly_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResendConfig {
    /// Wake-queue timeout; also the minimum gap between sweep retries of
    /// the same message to the same node.
    pub interval_secs: u64,
    /// Max messages sent per explicit wake.
    pub batch_limit: usize,
    /// Max messages retried per node per sweep.
    pub sweep_limit: usize,
}

/// One remote node in the contest fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: u32,
    pub host: String,
    #[serde(default = "default_peer_port")]
    pub udp_port: u16,
    /// 0 = same as `udp_port`.
    #[serde(default)]
    pub tcp_port: u16,
}

fn default_peer_port() -> u16 {
    DEFAULT_PEER_PORT
}

impl PeerConfig {
    pub fn effective_tcp_port(&self) -> u16 {
        if self.tcp_port == 0 {
            self.udp_port
        } else {
            self.tcp_port
        }
    }
}

impl MessengerConfig {
    pub fn effective_tcp_port(&self) -> u16 {
        if self.tcp_port == 0 {
            self.port
        } else {
            self.tcp_port
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for AbacusConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            messenger: MessengerConfig::default(),
            resend: ResendConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            name: String::new(),
        }
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            kind: "udp".to_string(),
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PEER_PORT,
            tcp_port: 0,
            cipher: "chacha20-poly1305".to_string(),
            key_file: config_dir().join("peer.key"),
            iv_file: config_dir().join("peer.iv"),
            checksum_seed: 0,
            min_delay_us: 50,
            max_delay_us: 200_000,
            init_delay_us: 1_000,
            max_fragment_size: 1_200,
            inline_limit: 8 * 1_200,
            reassembly_ttl_secs: 300,
        }
    }
}

impl Default for ResendConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            batch_limit: 256,
            sweep_limit: 1,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("abacus")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl AbacusConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            AbacusConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("ABACUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&AbacusConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply ABACUS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("ABACUS_NODE__ID") {
            if let Ok(id) = v.parse() {
                self.node.id = id;
            }
        }
        if let Some(v) = get("ABACUS_MESSENGER__PORT") {
            if let Ok(p) = v.parse() {
                self.messenger.port = p;
            }
        }
        if let Some(v) = get("ABACUS_MESSENGER__KIND") {
            self.messenger.kind = v;
        }
        if let Some(v) = get("ABACUS_MESSENGER__CIPHER") {
            self.messenger.cipher = v;
        }
    }

    /// Check bounds that would otherwise surface as misbehaviour at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.messenger;
        if self.node.id == 0 || self.node.id > MAX_NODE_ID {
            return Err(ConfigError::Invalid(format!(
                "node.id {} outside 1..={MAX_NODE_ID}",
                self.node.id
            )));
        }
        if !(MIN_FRAGMENT_SIZE..=MAX_FRAGMENT_SIZE).contains(&m.max_fragment_size) {
            return Err(ConfigError::Invalid(format!(
                "messenger.max_fragment_size {} outside {MIN_FRAGMENT_SIZE}..={MAX_FRAGMENT_SIZE}",
                m.max_fragment_size
            )));
        }
        if m.min_delay_us == 0 {
            return Err(ConfigError::Invalid("messenger.min_delay_us must be > 0".into()));
        }
        if !(m.min_delay_us <= m.init_delay_us && m.init_delay_us <= m.max_delay_us) {
            return Err(ConfigError::Invalid(format!(
                "backoff delays must satisfy min <= init <= max (got {} / {} / {})",
                m.min_delay_us, m.init_delay_us, m.max_delay_us
            )));
        }
        if self.resend.interval_secs == 0 {
            return Err(ConfigError::Invalid("resend.interval_secs must be > 0".into()));
        }
        for peer in &self.peers {
            if peer.id == 0 || peer.id > MAX_NODE_ID {
                return Err(ConfigError::Invalid(format!(
                    "peer id {} outside 1..={MAX_NODE_ID}",
                    peer.id
                )));
            }
            if self.peers.iter().filter(|p| p.id == peer.id).count() > 1 {
                return Err(ConfigError::Invalid(format!("peer id {} listed twice", peer.id)));
            }
        }
        Ok(())
    }
}
