//! Resend coordinator: turns best-effort sends into at-least-once delivery.
//!
//! The coordinator waits on a wake queue with a timeout. A wake names a
//! node and flushes everything that node has not acknowledged. A timeout
//! (or a sweep falling overdue under a steady stream of wakes) retries
//! the oldest unacknowledged messages for every remote node.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use abacus_core::config::ResendConfig;
use abacus_core::{Message, MessageKey};
use tokio::sync::{broadcast, mpsc};

use crate::messenger::PeerMessenger;
use crate::store::{MessageStore, PeerDirectory};

/// Entry point for locally created messages and for anything else that
/// wants a node flushed now.
#[derive(Clone)]
pub struct ResendHandle {
    wake_tx: mpsc::UnboundedSender<u32>,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn PeerDirectory>,
}

impl ResendHandle {
    pub fn wake(&self, node: u32) {
        if self.wake_tx.send(node).is_err() {
            tracing::debug!(node, "resend coordinator stopped, wake ignored");
        }
    }

    /// Store a new local message and wake every remote node for it.
    pub fn publish(&self, message: &Message) {
        if !self.store.put_message(message) {
            tracing::debug!(message = %message.key(), "publish of stored message");
        }
        for node in self.directory.list_remote_nodes() {
            self.wake(node);
        }
    }
}

pub struct ResendCoordinator {
    messenger: Arc<dyn PeerMessenger>,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn PeerDirectory>,
    interval: Duration,
    batch_limit: usize,
    sweep_limit: usize,
    wake_rx: mpsc::UnboundedReceiver<u32>,
    /// When each message was last sent to each node.
    last_sent: HashMap<(u32, MessageKey), Instant>,
    last_sweep: Instant,
    shutdown: broadcast::Receiver<()>,
}

impl ResendCoordinator {
    pub fn new(
        messenger: Arc<dyn PeerMessenger>,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn PeerDirectory>,
        config: &ResendConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, ResendHandle) {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let handle = ResendHandle {
            wake_tx,
            store: store.clone(),
            directory: directory.clone(),
        };
        let coordinator = Self {
            messenger,
            store,
            directory,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            batch_limit: config.batch_limit.max(1),
            sweep_limit: config.sweep_limit.max(1),
            wake_rx,
            last_sent: HashMap::new(),
            last_sweep: Instant::now(),
            shutdown,
        };
        (coordinator, handle)
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            batch_limit = self.batch_limit,
            sweep_limit = self.sweep_limit,
            "resend coordinator started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("resend coordinator shutting down");
                    return Ok(());
                }

                woken = tokio::time::timeout(self.interval, self.wake_rx.recv()) => match woken {
                    Ok(Some(node)) => {
                        let mut nodes = BTreeSet::from([node]);
                        while let Ok(more) = self.wake_rx.try_recv() {
                            nodes.insert(more);
                        }
                        for node in nodes {
                            self.flush(node).await;
                        }
                        if self.last_sweep.elapsed() >= self.interval {
                            self.sweep().await;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("all resend handles dropped, coordinator exiting");
                        return Ok(());
                    }
                    Err(_) => self.sweep().await,
                },
            }
        }
    }

    /// Send everything `node` has not acknowledged, up to the batch limit.
    async fn flush(&mut self, node: u32) {
        let pending = self.store.fetch_unacked(node, None, self.batch_limit);
        if pending.is_empty() {
            return;
        }
        tracing::debug!(node, count = pending.len(), "flushing unacked messages");
        for message in &pending {
            self.messenger.send(node, message).await;
            self.last_sent.insert((node, message.key()), Instant::now());
        }
    }

    /// Retry the oldest unacknowledged messages for every remote node,
    /// skipping any sent to that node within the last interval.
    async fn sweep(&mut self) {
        let now = Instant::now();
        let interval = self.interval;
        self.last_sent
            .retain(|_, sent| now.saturating_duration_since(*sent) < interval);

        let mut retried = 0usize;
        for node in self.directory.list_remote_nodes() {
            let due: Vec<Message> = self
                .store
                .fetch_unacked(node, None, self.batch_limit)
                .into_iter()
                .filter(|m| !self.last_sent.contains_key(&(node, m.key())))
                .take(self.sweep_limit)
                .collect();

            for message in &due {
                tracing::debug!(node, message = %message.key(), "retrying unacked message");
                self.messenger.send(node, message).await;
                self.last_sent.insert((node, message.key()), Instant::now());
                retried += 1;
            }
        }

        if retried > 0 {
            tracing::info!(retried, "resend sweep");
        }
        self.last_sweep = Instant::now();
    }
}
