//! Transport counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TransportStats {
    pub datagrams_sent: AtomicU64,
    pub datagrams_received: AtomicU64,
    pub acks_sent: AtomicU64,
    pub acks_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub duplicates_acked: AtomicU64,
    pub tcp_records_sent: AtomicU64,
    pub tcp_records_received: AtomicU64,
    pub dropped_decrypt: AtomicU64,
    pub dropped_malformed: AtomicU64,
    pub dropped_duplicate_fragment: AtomicU64,
    pub decode_failures: AtomicU64,
    pub send_errors: AtomicU64,
    pub evicted_partials: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub duplicates_acked: u64,
    pub tcp_records_sent: u64,
    pub tcp_records_received: u64,
    pub dropped_decrypt: u64,
    pub dropped_malformed: u64,
    pub dropped_duplicate_fragment: u64,
    pub decode_failures: u64,
    pub send_errors: u64,
    pub evicted_partials: u64,
}

impl TransportStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            datagrams_sent: get(&self.datagrams_sent),
            datagrams_received: get(&self.datagrams_received),
            acks_sent: get(&self.acks_sent),
            acks_received: get(&self.acks_received),
            messages_sent: get(&self.messages_sent),
            messages_received: get(&self.messages_received),
            duplicates_acked: get(&self.duplicates_acked),
            tcp_records_sent: get(&self.tcp_records_sent),
            tcp_records_received: get(&self.tcp_records_received),
            dropped_decrypt: get(&self.dropped_decrypt),
            dropped_malformed: get(&self.dropped_malformed),
            dropped_duplicate_fragment: get(&self.dropped_duplicate_fragment),
            decode_failures: get(&self.decode_failures),
            send_errors: get(&self.send_errors),
            evicted_partials: get(&self.evicted_partials),
        }
    }
}

impl StatsSnapshot {
    /// Log the counters at info. Called from the daemon's stats task.
    pub fn log(&self, transport: &str) {
        tracing::info!(
            transport,
            sent = self.messages_sent,
            received = self.messages_received,
            datagrams_out = self.datagrams_sent,
            datagrams_in = self.datagrams_received,
            acks_out = self.acks_sent,
            acks_in = self.acks_received,
            duplicates = self.duplicates_acked,
            tcp_out = self.tcp_records_sent,
            tcp_in = self.tcp_records_received,
            "transport stats"
        );

        let dropped = self.dropped_decrypt
            + self.dropped_malformed
            + self.dropped_duplicate_fragment
            + self.decode_failures
            + self.send_errors
            + self.evicted_partials;
        if dropped > 0 {
            tracing::info!(
                transport,
                decrypt = self.dropped_decrypt,
                malformed = self.dropped_malformed,
                duplicate_fragments = self.dropped_duplicate_fragment,
                undecodable = self.decode_failures,
                send_errors = self.send_errors,
                evicted = self.evicted_partials,
                "transport drops"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = TransportStats::default();
        TransportStats::bump(&stats.acks_sent);
        TransportStats::bump(&stats.acks_sent);
        TransportStats::add(&stats.evicted_partials, 3);

        let snap = stats.snapshot();
        assert_eq!(snap.acks_sent, 2);
        assert_eq!(snap.evicted_partials, 3);
        assert_eq!(snap.messages_sent, 0);
    }
}
