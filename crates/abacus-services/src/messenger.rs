//! The peer messenger contract and the transport registry.
//!
//! A messenger moves immutable messages between nodes. It promises very
//! little on its own: `send` is one best-effort attempt and may lose the
//! message entirely. At-least-once delivery comes from the resend
//! coordinator retrying until the store has an ack from every peer.
//!
//! Which transport a node runs is picked by `messenger.kind` in the
//! config and handed around as `Arc<dyn PeerMessenger>`.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use abacus_core::config::AbacusConfig;
use abacus_core::crypto::CryptoError;
use abacus_core::Message;
use async_trait::async_trait;
use thiserror::Error;

use crate::backoff::BackoffLimits;
use crate::hybrid::HybridPeerMessenger;
use crate::stats::StatsSnapshot;
use crate::store::{MessageStore, PeerDirectory};
use crate::udp::UdpPeerMessenger;

#[async_trait]
pub trait PeerMessenger: Send + Sync {
    /// Short transport name for logs.
    fn name(&self) -> &'static str;

    /// Load key material, bind sockets, start the receiver. Must be called
    /// once before anything else; failure means the node cannot run.
    async fn initialise(&self) -> Result<(), MessengerError>;

    /// One attempt at delivering `message` to `dest`. Never reports
    /// failure; problems are logged and counted.
    async fn send(&self, dest: u32, message: &Message);

    /// The next complete, never-before-stored message. `None` once the
    /// messenger has shut down.
    async fn receive(&self) -> Option<Message>;

    /// Tell every remote node this node now durably holds the message.
    async fn send_ack(&self, origin_id: u32, message_id: u32);

    /// Stop the receiver and unblock `receive`.
    async fn shutdown(&self);

    fn stats(&self) -> StatsSnapshot;
}

// ── Settings ──────────────────────────────────────────────────────────────────

/// Everything a transport needs from the config, resolved once.
#[derive(Debug, Clone)]
pub struct MessengerSettings {
    pub local_id: u32,
    pub bind_ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub cipher: String,
    pub key_file: PathBuf,
    pub iv_file: PathBuf,
    pub checksum_seed: u32,
    pub backoff: BackoffLimits,
    pub max_fragment_size: usize,
    pub inline_limit: usize,
    pub reassembly_ttl: Duration,
}

impl MessengerSettings {
    pub fn from_config(config: &AbacusConfig) -> Result<Self, MessengerError> {
        let m = &config.messenger;
        let bind_ip = m
            .bind
            .parse()
            .map_err(|_| MessengerError::BadBindAddress(m.bind.clone()))?;
        Ok(Self {
            local_id: config.node.id,
            bind_ip,
            udp_port: m.port,
            tcp_port: m.effective_tcp_port(),
            cipher: m.cipher.clone(),
            key_file: m.key_file.clone(),
            iv_file: m.iv_file.clone(),
            checksum_seed: m.checksum_seed,
            backoff: BackoffLimits {
                min_us: m.min_delay_us,
                init_us: m.init_delay_us,
                max_us: m.max_delay_us,
            },
            max_fragment_size: m.max_fragment_size,
            inline_limit: m.inline_limit,
            reassembly_ttl: Duration::from_secs(m.reassembly_ttl_secs),
        })
    }

    pub fn udp_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.udp_port)
    }

    pub fn tcp_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.tcp_port)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Transport kinds this build can construct.
pub const KNOWN_KINDS: &[&str] = &["udp", "udtcp"];

/// Construct the messenger named by `config.messenger.kind`. The result is
/// not yet initialised.
pub fn build_messenger(
    config: &AbacusConfig,
    directory: Arc<dyn PeerDirectory>,
    store: Arc<dyn MessageStore>,
) -> Result<Arc<dyn PeerMessenger>, MessengerError> {
    let settings = MessengerSettings::from_config(config)?;
    match config.messenger.kind.as_str() {
        "udp" => Ok(Arc::new(UdpPeerMessenger::new(settings, directory, store))),
        "udtcp" => Ok(Arc::new(HybridPeerMessenger::new(settings, directory, store))),
        other => Err(MessengerError::UnknownKind(other.to_string())),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("unknown messenger kind {0:?} (known: udp, udtcp)")]
    UnknownKind(String),

    #[error("bad bind address {0:?}")]
    BadBindAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("messenger already initialised")]
    AlreadyInitialised,

    #[error("messenger has been shut down")]
    Closed,
}
