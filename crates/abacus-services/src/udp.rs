//! UDP peer transport.
//!
//! Send path: partition the blob, shuffle, seal each fragment as its own
//! datagram, and pace the burst with the destination's backoff.
//!
//! Receive path: one task owns the socket reader and the reassembler.
//! Each datagram is opened, checked, deduplicated against the store and
//! folded into reassembly; finished blobs become messages on the inbound
//! queue that `receive()` drains.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use abacus_core::crypto::{CipherKind, DatagramCipher};
use abacus_core::fragment::{partition, shuffle};
use abacus_core::wire::{AckFrame, DataFrame, Frame};
use abacus_core::{Message, MessageKey};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::address::{AddressResolver, Channel};
use crate::backoff::Backoff;
use crate::messenger::{MessengerError, MessengerSettings, PeerMessenger};
use crate::reassembly::{Accepted, Reassembler};
use crate::stats::{StatsSnapshot, TransportStats};
use crate::store::{MessageStore, PeerDirectory};

/// Largest datagram the receiver will read.
const MAX_DATAGRAM: usize = 65_536;

/// Requested kernel receive buffer. Bursts of fragments from several
/// peers land together.
const RECV_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Completed messages waiting for `receive()`. When full, new messages
/// are dropped unacked and the sender retries them later.
const INBOUND_QUEUE: usize = 1024;

/// Sealed frames handed to the receiver from outside the UDP socket.
const INJECT_QUEUE: usize = 64;

/// A sealed frame that arrived by some other channel, plus its source.
pub(crate) type Injected = (Vec<u8>, SocketAddr);

// ── Link ──────────────────────────────────────────────────────────────────────

/// Everything that exists only after `initialise`: the socket, the cipher,
/// and the per-destination state. Shared by the send path and the
/// receiver task.
pub(crate) struct Link {
    pub(crate) local_id: u32,
    seed: u32,
    max_fragment_size: usize,
    socket: UdpSocket,
    pub(crate) cipher: DatagramCipher,
    backoff: Backoff,
    pub(crate) resolver: AddressResolver,
    directory: Arc<dyn PeerDirectory>,
    store: Arc<dyn MessageStore>,
    pub(crate) stats: Arc<TransportStats>,
}

impl Link {
    /// Encode and seal a frame. Failures are logged and counted.
    pub(crate) fn seal(&self, frame: &Frame) -> Option<Vec<u8>> {
        match self.cipher.seal(&frame.encode(self.seed)) {
            Ok(sealed) => Some(sealed),
            Err(e) => {
                tracing::error!(error = %e, "failed to seal frame");
                TransportStats::bump(&self.stats.send_errors);
                None
            }
        }
    }

    async fn emit(&self, frame: &Frame, addr: SocketAddr) -> bool {
        let Some(sealed) = self.seal(frame) else {
            return false;
        };
        match self.socket.send_to(&sealed, addr).await {
            Ok(_) => {
                TransportStats::bump(&self.stats.datagrams_sent);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, %addr, "send_to failed");
                TransportStats::bump(&self.stats.send_errors);
                false
            }
        }
    }

    /// One pass over every fragment of `message`, in a fresh random order.
    pub(crate) async fn send_fragments(&self, dest: u32, message: &Message) {
        let addr = match self.resolver.resolve(dest, Channel::Udp).await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(dest, error = %e, "cannot address peer, send skipped");
                TransportStats::bump(&self.stats.send_errors);
                return;
            }
        };

        let blob = message.blob();
        let mut order = match partition(blob.len(), self.max_fragment_size) {
            Ok(fragments) => fragments,
            Err(e) => {
                tracing::error!(message = %message.key(), error = %e, "cannot fragment message");
                TransportStats::bump(&self.stats.send_errors);
                return;
            }
        };
        shuffle(&mut order, &mut rand::thread_rng());

        for (i, fragment) in order.iter().enumerate() {
            if i > 0 {
                self.backoff.pace(dest).await;
            }
            let frame = Frame::Data(DataFrame {
                sender_id: self.local_id,
                key: message.key(),
                fragment_num: fragment.num,
                last: fragment.last,
                payload: fragment.slice(blob),
            });
            self.emit(&frame, addr).await;
        }

        TransportStats::bump(&self.stats.messages_sent);
        tracing::trace!(
            dest,
            message = %message.key(),
            fragments = order.len(),
            "message sent"
        );
    }

    async fn send_ack_to(&self, dest: u32, key: MessageKey) {
        let addr = match self.resolver.resolve(dest, Channel::Udp).await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(dest, error = %e, "cannot address peer, ack skipped");
                TransportStats::bump(&self.stats.send_errors);
                return;
            }
        };
        let frame = Frame::Ack(AckFrame {
            sender_id: self.local_id,
            key,
            acking_id: self.local_id,
        });
        if self.emit(&frame, addr).await {
            TransportStats::bump(&self.stats.acks_sent);
        }
    }

    pub(crate) async fn broadcast_ack(&self, key: MessageKey) {
        for node in self.directory.list_remote_nodes() {
            self.send_ack_to(node, key).await;
        }
        tracing::trace!(message = %key, "ack broadcast");
    }

    /// The inbound pipeline for one sealed frame.
    pub(crate) async fn handle_datagram(
        &self,
        reassembler: &mut Reassembler,
        datagram: &[u8],
        from: SocketAddr,
        inbound: &mpsc::Sender<Message>,
    ) {
        TransportStats::bump(&self.stats.datagrams_received);

        let plaintext = match self.cipher.open(datagram) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(%from, error = %e, "datagram failed to open, discarding");
                TransportStats::bump(&self.stats.dropped_decrypt);
                return;
            }
        };

        let frame = match Frame::decode(&plaintext, self.seed) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(%from, error = %e, "malformed frame, discarding");
                TransportStats::bump(&self.stats.dropped_malformed);
                return;
            }
        };

        match frame {
            Frame::Ack(ack) => {
                TransportStats::bump(&self.stats.acks_received);
                self.store.record_ack(ack.key, ack.acking_id);
                let delay = self.backoff.decrease(ack.sender_id);
                tracing::trace!(
                    message = %ack.key,
                    acker = ack.acking_id,
                    delay_us = delay.as_micros() as u64,
                    "ack received"
                );
            }
            Frame::Data(data) => {
                if self.store.has_message(data.key) {
                    tracing::debug!(
                        message = %data.key,
                        from = data.sender_id,
                        "already stored, re-acking"
                    );
                    TransportStats::bump(&self.stats.duplicates_acked);
                    self.broadcast_ack(data.key).await;
                    return;
                }

                let key = data.key;
                match reassembler.accept(data, Instant::now()) {
                    Accepted::Pending => {}
                    Accepted::Duplicate => {
                        TransportStats::bump(&self.stats.dropped_duplicate_fragment);
                    }
                    Accepted::Inconsistent => {
                        TransportStats::bump(&self.stats.dropped_malformed);
                    }
                    Accepted::Complete(blob) => match Message::decode(blob) {
                        Ok(message) if message.key() != key => {
                            tracing::warn!(
                                message = %key,
                                blob_key = %message.key(),
                                "blob header disagrees with frame, dropped"
                            );
                            TransportStats::bump(&self.stats.dropped_malformed);
                        }
                        Ok(message) => self.deliver(message, inbound),
                        Err(e) => {
                            // Not acked, so the origin keeps retrying. A
                            // newer build on this node is the only fix.
                            tracing::error!(message = %key, error = %e, "reassembled blob is undecodable, dropped");
                            TransportStats::bump(&self.stats.decode_failures);
                        }
                    },
                }
            }
        }
    }

    fn deliver(&self, message: Message, inbound: &mpsc::Sender<Message>) {
        let key = message.key();
        match inbound.try_send(message) {
            Ok(()) => {
                TransportStats::bump(&self.stats.messages_received);
                tracing::debug!(message = %key, "message received");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(message = %key, "inbound queue full, dropping until resent");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(message = %key, "inbound queue closed");
            }
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

// ── Receiver task ─────────────────────────────────────────────────────────────

fn eviction_period(ttl: Duration) -> Duration {
    (ttl / 4).clamp(Duration::from_millis(100), Duration::from_secs(30))
}

async fn receive_loop(
    link: Arc<Link>,
    inbound: mpsc::Sender<Message>,
    mut injected: mpsc::Receiver<Injected>,
    mut shutdown: broadcast::Receiver<()>,
    ttl: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut reassembler = Reassembler::new();
    let mut evict = tokio::time::interval(eviction_period(ttl));
    evict.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            result = link.socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => {
                    link.handle_datagram(&mut reassembler, &buf[..len], from, &inbound).await;
                }
                Err(e) if is_transient(&e) => {
                    tracing::debug!(error = %e, "recv_from failed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "udp socket lost, receiver stopping");
                    break;
                }
            },

            Some((record, from)) = injected.recv() => {
                link.handle_datagram(&mut reassembler, &record, from, &inbound).await;
            }

            _ = evict.tick() => {
                let evicted = reassembler.evict_stale(Instant::now(), ttl);
                if evicted > 0 {
                    TransportStats::add(&link.stats.evicted_partials, evicted as u64);
                }
            }
        }
    }

    tracing::debug!(partial = reassembler.len(), "receiver stopped");
}

/// Errors a UDP socket reports for a single datagram (ICMP feedback from
/// an earlier send, signals, spurious wakeups). Anything else means the
/// descriptor itself is gone.
fn is_transient(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    )
}

fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
        tracing::debug!(error = %e, "SO_RCVBUF not applied");
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

// ── Messenger ─────────────────────────────────────────────────────────────────

pub struct UdpPeerMessenger {
    settings: MessengerSettings,
    directory: Arc<dyn PeerDirectory>,
    store: Arc<dyn MessageStore>,
    stats: Arc<TransportStats>,
    link: OnceLock<Arc<Link>>,
    inbound_tx: Mutex<Option<mpsc::Sender<Message>>>,
    inbound_rx: Mutex<mpsc::Receiver<Message>>,
    inject_tx: mpsc::Sender<Injected>,
    inject_rx: Mutex<Option<mpsc::Receiver<Injected>>>,
    shutdown_tx: broadcast::Sender<()>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpPeerMessenger {
    pub fn new(
        settings: MessengerSettings,
        directory: Arc<dyn PeerDirectory>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (inject_tx, inject_rx) = mpsc::channel(INJECT_QUEUE);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        Self {
            settings,
            directory,
            store,
            stats: Arc::new(TransportStats::default()),
            link: OnceLock::new(),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(inbound_rx),
            inject_tx,
            inject_rx: Mutex::new(Some(inject_rx)),
            shutdown_tx,
            receiver: Mutex::new(None),
        }
    }

    /// Bound UDP address, once initialised.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.get().and_then(|l| l.local_addr())
    }

    pub(crate) fn link(&self) -> Option<&Arc<Link>> {
        self.link.get()
    }

    pub(crate) fn injector(&self) -> mpsc::Sender<Injected> {
        self.inject_tx.clone()
    }

    pub(crate) fn settings(&self) -> &MessengerSettings {
        &self.settings
    }

    pub(crate) fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

#[async_trait]
impl PeerMessenger for UdpPeerMessenger {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn initialise(&self) -> Result<(), MessengerError> {
        if self.link.get().is_some() {
            return Err(MessengerError::AlreadyInitialised);
        }
        let inbound = self
            .inbound_tx
            .lock()
            .await
            .take()
            .ok_or(MessengerError::Closed)?;
        let injected = self
            .inject_rx
            .lock()
            .await
            .take()
            .ok_or(MessengerError::AlreadyInitialised)?;

        let s = &self.settings;
        let kind: CipherKind = s.cipher.parse()?;
        let cipher = DatagramCipher::load(kind, &s.key_file, &s.iv_file)?;

        let addr = s.udp_bind_addr();
        let socket = bind_udp(addr).map_err(|source| MessengerError::Bind { addr, source })?;

        let link = Arc::new(Link {
            local_id: s.local_id,
            seed: s.checksum_seed,
            max_fragment_size: s.max_fragment_size,
            socket,
            cipher,
            backoff: Backoff::new(s.backoff),
            resolver: AddressResolver::new(self.directory.clone()),
            directory: self.directory.clone(),
            store: self.store.clone(),
            stats: self.stats.clone(),
        });
        if self.link.set(link.clone()).is_err() {
            return Err(MessengerError::AlreadyInitialised);
        }

        tracing::info!(
            node = s.local_id,
            addr = ?link.local_addr(),
            cipher = %kind,
            max_fragment = s.max_fragment_size,
            "udp messenger listening"
        );

        let handle = tokio::spawn(receive_loop(
            link,
            inbound,
            injected,
            self.shutdown_tx.subscribe(),
            s.reassembly_ttl,
        ));
        *self.receiver.lock().await = Some(handle);
        Ok(())
    }

    async fn send(&self, dest: u32, message: &Message) {
        let Some(link) = self.link.get() else {
            tracing::warn!(dest, "send before initialise, ignored");
            return;
        };
        if dest == link.local_id {
            tracing::debug!(message = %message.key(), "not sending to self");
            return;
        }
        link.send_fragments(dest, message).await;
    }

    async fn receive(&self) -> Option<Message> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn send_ack(&self, origin_id: u32, message_id: u32) {
        let Some(link) = self.link.get() else {
            tracing::warn!("send_ack before initialise, ignored");
            return;
        };
        link.broadcast_ack(MessageKey::new(origin_id, message_id)).await;
    }

    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        // Never initialised: dropping the sender is what unblocks receive().
        self.inbound_tx.lock().await.take();

        let handle = self.receiver.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "receiver task failed");
            }
        }
        tracing::info!(node = self.settings.local_id, "udp messenger stopped");
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
