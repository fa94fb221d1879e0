//! Integration tests for the Abacus replication transport.
//!
//! Every test runs a small cluster of nodes inside this process, each bound
//! to an OS-assigned port on 127.0.0.1. Nodes learn each other's ports
//! through `PeerTable::set_peer` once everything is listening.
//!
//! Run with:
//!   cargo test -p integration -- --test-threads=4

mod hybrid;
mod lifecycle;
mod replication;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use abacus_core::config::{AbacusConfig, ResendConfig};
use abacus_services::{
    apply_inbound, HybridPeerMessenger, MemoryStore, MessengerSettings, PeerAddress,
    PeerMessenger, PeerTable, ResendCoordinator, ResendHandle, UdpPeerMessenger,
};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ── Cluster harness ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Udp,
    Hybrid,
}

pub struct TestNode {
    pub id: u32,
    pub table: PeerTable,
    pub store: MemoryStore,
    pub messenger: Arc<dyn PeerMessenger>,
    pub udp_addr: SocketAddr,
    pub tcp_addr: Option<SocketAddr>,
    pub resend: ResendHandle,
    shutdown_tx: broadcast::Sender<()>,
    inbound: JoinHandle<u64>,
}

impl TestNode {
    /// Address other nodes should use to reach this one.
    pub fn address(&self) -> PeerAddress {
        PeerAddress {
            host: "127.0.0.1".into(),
            udp_port: self.udp_addr.port(),
            tcp_port: self.tcp_addr.map(|a| a.port()).unwrap_or(0),
        }
    }

    /// Stop the coordinator and messenger; returns how many messages the
    /// inbound loop applied.
    pub async fn stop(self) -> u64 {
        let _ = self.shutdown_tx.send(());
        self.messenger.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), self.inbound)
            .await
            .expect("inbound loop did not finish")
            .expect("inbound loop panicked")
    }
}

/// Key and iv files shared by every node of one test.
pub fn key_files(tag: &str) -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!("abacus-it-{tag}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let key = dir.join("peer.key");
    let iv = dir.join("peer.iv");
    std::fs::write(&key, [0x3cu8; 32]).unwrap();
    std::fs::write(&iv, [0x5eu8; 12]).unwrap();
    (key, iv)
}

/// Config for a loopback node with short delays and a one second resend.
pub fn node_config(id: u32, kind: Kind, tag: &str) -> AbacusConfig {
    let (key, iv) = key_files(tag);
    let mut config = AbacusConfig::default();
    config.node.id = id;
    config.node.name = format!("{tag}-{id}");
    config.messenger.kind = match kind {
        Kind::Udp => "udp",
        Kind::Hybrid => "udtcp",
    }
    .into();
    config.messenger.bind = "127.0.0.1".into();
    config.messenger.port = 0;
    config.messenger.key_file = key;
    config.messenger.iv_file = iv;
    config.messenger.checksum_seed = 0x0bad_5eed;
    config.messenger.min_delay_us = 1;
    config.messenger.init_delay_us = 10;
    config.messenger.max_delay_us = 200;
    config.messenger.max_fragment_size = 256;
    config.messenger.inline_limit = 2_048;
    config.resend = ResendConfig {
        interval_secs: 1,
        batch_limit: 64,
        sweep_limit: 1,
    };
    config
}

pub async fn spawn_node(id: u32, kind: Kind, tag: &str) -> TestNode {
    spawn_with(node_config(id, kind, tag), kind).await
}

pub async fn spawn_with(config: AbacusConfig, kind: Kind) -> TestNode {
    let id = config.node.id;
    let table = PeerTable::new(id, Vec::new());
    let store = MemoryStore::new();
    let settings = MessengerSettings::from_config(&config).unwrap();

    let (messenger, udp_addr, tcp_addr): (Arc<dyn PeerMessenger>, _, _) = match kind {
        Kind::Udp => {
            let m = UdpPeerMessenger::new(settings, Arc::new(table.clone()), Arc::new(store.clone()));
            m.initialise().await.unwrap();
            let udp = m.local_addr().unwrap();
            (Arc::new(m), udp, None)
        }
        Kind::Hybrid => {
            let m =
                HybridPeerMessenger::new(settings, Arc::new(table.clone()), Arc::new(store.clone()));
            m.initialise().await.unwrap();
            let udp = m.udp_addr().unwrap();
            let tcp = m.tcp_addr();
            (Arc::new(m), udp, tcp)
        }
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    let inbound = tokio::spawn(apply_inbound(messenger.clone(), Arc::new(store.clone())));
    let (coordinator, resend) = ResendCoordinator::new(
        messenger.clone(),
        Arc::new(store.clone()),
        Arc::new(table.clone()),
        &config.resend,
        shutdown_tx.subscribe(),
    );
    tokio::spawn(coordinator.run());

    TestNode {
        id,
        table,
        store,
        messenger,
        udp_addr,
        tcp_addr,
        resend,
        shutdown_tx,
        inbound,
    }
}

/// Register every node in every other node's table.
pub fn introduce_all(nodes: &[&TestNode]) {
    for a in nodes {
        for b in nodes {
            if a.id != b.id {
                a.table.set_peer(b.id, b.address());
            }
        }
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Lossy relay ───────────────────────────────────────────────────────────────

/// One-way UDP relay that drops the first `drop_first` datagrams it sees
/// and forwards the rest to `target`.
pub struct LossyRelay {
    pub addr: SocketAddr,
    pub dropped: Arc<AtomicUsize>,
    pub forwarded: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl LossyRelay {
    pub async fn start(target: SocketAddr, drop_first: usize) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));
        let forwarded = Arc::new(AtomicUsize::new(0));

        let task = {
            let dropped = dropped.clone();
            let forwarded = forwarded.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65_536];
                loop {
                    let Ok((n, _)) = socket.recv_from(&mut buf).await else {
                        return;
                    };
                    if dropped.load(Ordering::Relaxed) < drop_first {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    if socket.send_to(&buf[..n], target).await.is_ok() {
                        forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        };

        Self {
            addr,
            dropped,
            forwarded,
            task,
        }
    }
}

impl Drop for LossyRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}
