//! Hybrid UDP + TCP transport.
//!
//! Small blobs take the ordinary UDP fragment path. Blobs above the inline
//! limit go as a single record over a short-lived TCP connection:
//!
//! ```text
//!   [len: u32 BE][sealed data frame, fragment 1 | LAST, whole blob]
//! ```
//!
//! The accept side hands each record to the UDP receiver task, so dedup,
//! reassembly, acks and the inbound queue are shared with the UDP path.
//! Acks always travel over UDP.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use abacus_core::wire::{DataFrame, Frame};
use abacus_core::Message;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::address::Channel;
use crate::messenger::{MessengerError, MessengerSettings, PeerMessenger};
use crate::stats::{StatsSnapshot, TransportStats};
use crate::store::{MessageStore, PeerDirectory};
use crate::udp::{Injected, Link, UdpPeerMessenger};

/// Largest sealed record accepted or sent over TCP.
pub const MAX_TCP_RECORD: usize = 64 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// An idle inbound connection is dropped after this long.
const RECORD_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HybridPeerMessenger {
    udp: UdpPeerMessenger,
    inline_limit: usize,
    tcp_addr: OnceLock<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl HybridPeerMessenger {
    pub fn new(
        settings: MessengerSettings,
        directory: Arc<dyn PeerDirectory>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let inline_limit = settings.inline_limit;
        Self {
            udp: UdpPeerMessenger::new(settings, directory, store),
            inline_limit,
            tcp_addr: OnceLock::new(),
            accept_task: Mutex::new(None),
        }
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr.get().copied()
    }

    async fn send_record(&self, link: &Link, dest: u32, message: &Message) -> Result<()> {
        let addr = link.resolver.resolve(dest, Channel::Tcp).await?;

        let frame = Frame::Data(DataFrame {
            sender_id: link.local_id,
            key: message.key(),
            fragment_num: 1,
            last: true,
            payload: message.blob().clone(),
        });
        let sealed = link.seal(&frame).context("failed to seal record")?;
        if sealed.len() > MAX_TCP_RECORD {
            bail!("record of {} bytes exceeds {MAX_TCP_RECORD}", sealed.len());
        }

        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .context("connect timed out")?
            .with_context(|| format!("connect to {addr}"))?;
        stream.write_u32(sealed.len() as u32).await.context("write record length")?;
        stream.write_all(&sealed).await.context("write record body")?;
        stream.shutdown().await.context("close record stream")?;

        TransportStats::bump(&link.stats.tcp_records_sent);
        TransportStats::bump(&link.stats.messages_sent);
        tracing::debug!(
            dest,
            message = %message.key(),
            bytes = sealed.len(),
            %addr,
            "message sent over tcp"
        );
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    injector: mpsc::Sender<Injected>,
    stats: Arc<TransportStats>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let injector = injector.clone();
                    let stats = stats.clone();
                    tokio::spawn(async move {
                        if let Err(e) = read_records(stream, peer, injector, stats).await {
                            tracing::warn!(%peer, error = %e, "tcp record stream dropped");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "tcp accept failed");
                }
            },
        }
    }
    tracing::debug!("tcp accept loop stopped");
}

async fn read_records(
    mut stream: TcpStream,
    peer: SocketAddr,
    injector: mpsc::Sender<Injected>,
    stats: Arc<TransportStats>,
) -> Result<()> {
    loop {
        let len = match tokio::time::timeout(RECORD_TIMEOUT, stream.read_u32()).await {
            Err(_) => bail!("idle for {}s", RECORD_TIMEOUT.as_secs()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(result) => result.context("read record length")? as usize,
        };
        if len > MAX_TCP_RECORD {
            TransportStats::bump(&stats.dropped_malformed);
            bail!("record of {len} bytes exceeds {MAX_TCP_RECORD}");
        }

        // Grows with what actually arrives, not with the declared length.
        let mut record = Vec::new();
        let read = tokio::time::timeout(
            RECORD_TIMEOUT,
            (&mut stream).take(len as u64).read_to_end(&mut record),
        )
        .await
        .context("record body timed out")?
        .context("read record body")?;
        if read < len {
            bail!("stream closed after {read} of {len} record bytes");
        }
        TransportStats::bump(&stats.tcp_records_received);

        if injector.send((record, peer)).await.is_err() {
            // receiver has stopped
            return Ok(());
        }
    }
}

#[async_trait]
impl PeerMessenger for HybridPeerMessenger {
    fn name(&self) -> &'static str {
        "udtcp"
    }

    async fn initialise(&self) -> Result<(), MessengerError> {
        self.udp.initialise().await?;

        let addr = self.udp.settings().tcp_bind_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| MessengerError::Bind { addr, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| MessengerError::Bind { addr, source })?;
        let _ = self.tcp_addr.set(bound);

        let stats = match self.udp.link() {
            Some(link) => link.stats.clone(),
            None => return Err(MessengerError::Closed),
        };

        tracing::info!(
            node = self.udp.settings().local_id,
            tcp = %bound,
            inline_limit = self.inline_limit,
            "tcp record listener started"
        );

        let handle = tokio::spawn(accept_loop(
            listener,
            self.udp.injector(),
            stats,
            self.udp.shutdown_signal(),
        ));
        *self.accept_task.lock().await = Some(handle);
        Ok(())
    }

    async fn send(&self, dest: u32, message: &Message) {
        if message.blob().len() <= self.inline_limit {
            return self.udp.send(dest, message).await;
        }

        let Some(link) = self.udp.link() else {
            tracing::warn!(dest, "send before initialise, ignored");
            return;
        };
        if dest == link.local_id {
            return;
        }
        if let Err(e) = self.send_record(link, dest, message).await {
            tracing::warn!(dest, message = %message.key(), error = %e, "tcp send failed");
            TransportStats::bump(&link.stats.send_errors);
        }
    }

    async fn receive(&self) -> Option<Message> {
        self.udp.receive().await
    }

    async fn send_ack(&self, origin_id: u32, message_id: u32) {
        self.udp.send_ack(origin_id, message_id).await;
    }

    async fn shutdown(&self) {
        self.udp.shutdown().await;
        let handle = self.accept_task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "tcp accept task failed");
            }
        }
    }

    fn stats(&self) -> StatsSnapshot {
        self.udp.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, PeerAddress, PeerTable};
    use crate::udp::tests::settings;
    use abacus_core::MessageType;

    struct Node {
        table: PeerTable,
        messenger: HybridPeerMessenger,
    }

    async fn node(id: u32, tag: &str) -> Node {
        let mut s = settings(id, tag);
        s.inline_limit = 512;
        let table = PeerTable::new(id, Vec::new());
        let messenger = HybridPeerMessenger::new(
            s,
            Arc::new(table.clone()),
            Arc::new(MemoryStore::new()),
        );
        messenger.initialise().await.unwrap();
        Node { table, messenger }
    }

    fn address_of(n: &Node) -> PeerAddress {
        PeerAddress {
            host: "127.0.0.1".into(),
            udp_port: n.messenger.udp_addr().unwrap().port(),
            tcp_port: n.messenger.tcp_addr().unwrap().port(),
        }
    }

    async fn pair(tag: &str) -> (Node, Node) {
        let a = node(1, tag).await;
        let b = node(2, tag).await;
        a.table.set_peer(2, address_of(&b));
        b.table.set_peer(1, address_of(&a));
        (a, b)
    }

    async fn recv(m: &HybridPeerMessenger) -> Message {
        tokio::time::timeout(Duration::from_secs(5), m.receive())
            .await
            .expect("timed out waiting for message")
            .expect("messenger closed")
    }

    #[tokio::test]
    async fn large_blob_goes_over_tcp() {
        let (a, b) = pair("hy-large").await;
        let payload = vec![0x5au8; 200_000];
        let msg = Message::new(1, 9, 0, MessageType::ProblemUpdate, &payload);

        a.messenger.send(2, &msg).await;
        assert_eq!(recv(&b.messenger).await, msg);
        assert_eq!(a.messenger.stats().tcp_records_sent, 1);
        assert_eq!(a.messenger.stats().datagrams_sent, 0);

        a.messenger.shutdown().await;
        b.messenger.shutdown().await;
    }

    #[tokio::test]
    async fn small_blob_stays_on_udp() {
        let (a, b) = pair("hy-small").await;
        let msg = Message::new(1, 10, 0, MessageType::Clarification, b"is n <= 10^9?");

        a.messenger.send(2, &msg).await;
        assert_eq!(recv(&b.messenger).await, msg);
        assert_eq!(a.messenger.stats().tcp_records_sent, 0);
        assert!(a.messenger.stats().datagrams_sent >= 1);

        a.messenger.shutdown().await;
        b.messenger.shutdown().await;
    }

    #[tokio::test]
    async fn truncated_record_is_not_delivered() {
        let b = node(2, "hy-short").await;
        let mut stream = TcpStream::connect(b.messenger.tcp_addr().unwrap()).await.unwrap();
        // claims a large record, sends a few bytes, hangs up
        stream.write_u32(MAX_TCP_RECORD as u32).await.unwrap();
        stream.write_all(&[0u8; 16]).await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = b.messenger.stats();
        assert_eq!(stats.tcp_records_received, 0);
        assert_eq!(stats.dropped_decrypt, 0);

        b.messenger.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_record_is_refused() {
        let b = node(2, "hy-oversize").await;
        let mut stream = TcpStream::connect(b.messenger.tcp_addr().unwrap()).await.unwrap();
        stream.write_u32(MAX_TCP_RECORD as u32 + 1).await.unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("connection was not closed");
        assert!(matches!(read, Ok(0) | Err(_)));

        b.messenger.shutdown().await;
    }
}
