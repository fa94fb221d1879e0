//! Lazy peer address resolution.
//!
//! A node's host name is looked up the first time something is sent to
//! it and the result is kept for the life of the process. Failed lookups
//! are not cached, so a peer whose name starts resolving later is picked
//! up on the next send.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::store::PeerDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Udp,
    Tcp,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("node {0} is not in the peer directory")]
    UnknownNode(u32),
    #[error("lookup of {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} resolved to no addresses")]
    NoAddress(String),
}

/// Caches `(node, channel) -> SocketAddr`.
#[derive(Clone)]
pub struct AddressResolver {
    directory: Arc<dyn PeerDirectory>,
    cache: Arc<DashMap<(u32, Channel), SocketAddr>>,
}

impl AddressResolver {
    pub fn new(directory: Arc<dyn PeerDirectory>) -> Self {
        Self {
            directory,
            cache: Arc::new(DashMap::new()),
        }
    }

    pub async fn resolve(&self, node_id: u32, channel: Channel) -> Result<SocketAddr, ResolveError> {
        if let Some(addr) = self.cache.get(&(node_id, channel)) {
            return Ok(*addr);
        }

        let peer = self
            .directory
            .resolve_peer_address(node_id)
            .ok_or(ResolveError::UnknownNode(node_id))?;
        let port = match channel {
            Channel::Udp => peer.udp_port,
            Channel::Tcp => peer.tcp_port,
        };

        let mut addrs = tokio::net::lookup_host((peer.host.as_str(), port))
            .await
            .map_err(|e| ResolveError::Lookup {
                host: peer.host.clone(),
                source: e,
            })?;
        let addr = addrs
            .next()
            .ok_or_else(|| ResolveError::NoAddress(peer.host.clone()))?;

        tracing::debug!(node = node_id, ?channel, %addr, "resolved peer address");
        self.cache.insert((node_id, channel), addr);
        Ok(addr)
    }

    pub fn cached(&self, node_id: u32, channel: Channel) -> Option<SocketAddr> {
        self.cache.get(&(node_id, channel)).map(|a| *a)
    }
}
