//! Per-destination inter-fragment pacing.
//!
//! Each burst of fragments to one node sleeps between fragments. The delay
//! doubles after every sleep and halves on every ack from that node, so a
//! peer that keeps up pulls the sender toward `min`, and one that drops
//! fragments pushes it toward `max`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffLimits {
    pub min_us: u32,
    pub init_us: u32,
    pub max_us: u32,
}

#[derive(Clone)]
pub struct Backoff {
    limits: BackoffLimits,
    delays: Arc<DashMap<u32, u32>>,
}

impl Backoff {
    pub fn new(limits: BackoffLimits) -> Self {
        Self {
            limits,
            delays: Arc::new(DashMap::new()),
        }
    }

    /// Current delay for `node`, initialising it on first use.
    pub fn current(&self, node: u32) -> Duration {
        let us = *self.delays.entry(node).or_insert(self.limits.init_us);
        Duration::from_micros(us as u64)
    }

    /// Double the delay, capped at `max`. Returns the new delay.
    pub fn increase(&self, node: u32) -> Duration {
        let mut entry = self.delays.entry(node).or_insert(self.limits.init_us);
        *entry = entry.saturating_mul(2).min(self.limits.max_us);
        Duration::from_micros(*entry as u64)
    }

    /// Halve the delay, floored at `min`. Returns the new delay.
    pub fn decrease(&self, node: u32) -> Duration {
        let mut entry = self.delays.entry(node).or_insert(self.limits.init_us);
        *entry = (*entry / 2).max(self.limits.min_us);
        Duration::from_micros(*entry as u64)
    }

    /// Sleep the current delay, then increase it. The shard lock is
    /// released before the await.
    pub async fn pace(&self, node: u32) {
        let delay = self.current(node);
        tokio::time::sleep(delay).await;
        self.increase(node);
    }
}
