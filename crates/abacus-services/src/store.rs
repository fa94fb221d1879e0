//! Collaborators the transport depends on but does not own: the peer
//! directory and the durable message store.
//!
//! Both are injected as trait objects. The in-memory implementations here
//! back the daemon until a persistent store is wired in, and drive every
//! test.

use std::collections::HashSet;
use std::sync::Arc;

use abacus_core::config::PeerConfig;
use abacus_core::{Message, MessageKey, MessageType};
use dashmap::DashMap;

// ── Peer directory ────────────────────────────────────────────────────────────

/// Where a remote node can be reached, before name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub udp_port: u16,
    pub tcp_port: u16,
}

/// Static knowledge of the contest fleet.
pub trait PeerDirectory: Send + Sync {
    fn local_id(&self) -> u32;

    /// Host and ports for `node_id`, or `None` if it is not a known peer.
    fn resolve_peer_address(&self, node_id: u32) -> Option<PeerAddress>;

    /// Every node except this one, ascending.
    fn list_remote_nodes(&self) -> Vec<u32>;
}

/// Directory seeded from the `[[peers]]` config table. Entries can be
/// replaced at runtime; the address resolver only consults it on a cache
/// miss.
#[derive(Clone)]
pub struct PeerTable {
    local_id: u32,
    peers: Arc<DashMap<u32, PeerAddress>>,
}

impl PeerTable {
    pub fn new(local_id: u32, peers: Vec<PeerConfig>) -> Self {
        let table = Self {
            local_id,
            peers: Arc::new(DashMap::new()),
        };
        for p in peers {
            let address = PeerAddress {
                host: p.host.clone(),
                udp_port: p.udp_port,
                tcp_port: p.effective_tcp_port(),
            };
            table.set_peer(p.id, address);
        }
        table
    }

    /// Add or replace a peer. The local node is never listed.
    pub fn set_peer(&self, node_id: u32, address: PeerAddress) {
        if node_id != self.local_id {
            self.peers.insert(node_id, address);
        }
    }
}

impl PeerDirectory for PeerTable {
    fn local_id(&self) -> u32 {
        self.local_id
    }

    fn resolve_peer_address(&self, node_id: u32) -> Option<PeerAddress> {
        self.peers.get(&node_id).map(|p| p.clone())
    }

    fn list_remote_nodes(&self) -> Vec<u32> {
        let mut nodes: Vec<u32> = self.peers.iter().map(|e| *e.key()).collect();
        nodes.sort_unstable();
        nodes
    }
}

// ── Message store ─────────────────────────────────────────────────────────────

/// Durable message state. Every method must be idempotent.
pub trait MessageStore: Send + Sync {
    fn has_message(&self, key: MessageKey) -> bool;

    /// Insert a message. Returns `false` if it was already present.
    fn put_message(&self, message: &Message) -> bool;

    /// Record that `node_id` durably holds `key`.
    fn record_ack(&self, key: MessageKey, node_id: u32);

    /// Messages `node_id` has not acknowledged and did not originate,
    /// oldest first, at most `limit`.
    fn fetch_unacked(
        &self,
        node_id: u32,
        type_filter: Option<MessageType>,
        limit: usize,
    ) -> Vec<Message>;
}

/// In-memory message store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    messages: Arc<DashMap<MessageKey, Message>>,
    /// key -> nodes that acknowledged it. May hold keys not yet stored.
    acks: Arc<DashMap<MessageKey, HashSet<u32>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, key: MessageKey) -> Option<Message> {
        self.messages.get(&key).map(|m| m.clone())
    }

    /// Nodes that have acknowledged `key`, ascending.
    pub fn acked_by(&self, key: MessageKey) -> Vec<u32> {
        let mut nodes: Vec<u32> = self
            .acks
            .get(&key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        nodes.sort_unstable();
        nodes
    }
}

impl MessageStore for MemoryStore {
    fn has_message(&self, key: MessageKey) -> bool {
        self.messages.contains_key(&key)
    }

    fn put_message(&self, message: &Message) -> bool {
        let mut inserted = false;
        self.messages.entry(message.key()).or_insert_with(|| {
            inserted = true;
            message.clone()
        });
        inserted
    }

    fn record_ack(&self, key: MessageKey, node_id: u32) {
        self.acks.entry(key).or_default().insert(node_id);
    }

    fn fetch_unacked(
        &self,
        node_id: u32,
        type_filter: Option<MessageType>,
        limit: usize,
    ) -> Vec<Message> {
        let mut pending: Vec<Message> = self
            .messages
            .iter()
            .filter(|entry| entry.origin_id() != node_id)
            .filter(|entry| type_filter.map_or(true, |t| entry.message_type() == t))
            .filter(|entry| {
                self.acks
                    .get(entry.key())
                    .map_or(true, |set| !set.contains(&node_id))
            })
            .map(|entry| entry.value().clone())
            .collect();

        pending.sort_by_key(|m| (m.timestamp(), m.key()));
        pending.truncate(limit);
        pending
    }
}
