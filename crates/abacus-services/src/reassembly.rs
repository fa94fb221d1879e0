//! Reassembly of fragmented blobs.
//!
//! Owned by exactly one receiver task, so nothing here is shared or
//! locked. Records are keyed by message, not by sender or attempt:
//! fragments of the same message from different attempts (or relayed by
//! different peers) merge into one record. A whole blob (fragment 1
//! flagged LAST) always completes on its own.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use abacus_core::wire::DataFrame;
use abacus_core::MessageKey;
use bytes::{Bytes, BytesMut};

struct Record {
    /// Known once the last-flagged fragment arrives.
    total: Option<u16>,
    fragments: BTreeMap<u16, Bytes>,
    first_seen: Instant,
    last_seen: Instant,
}

impl Record {
    fn new(now: Instant) -> Self {
        Self {
            total: None,
            fragments: BTreeMap::new(),
            first_seen: now,
            last_seen: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.total == Some(self.fragments.len() as u16)
    }

    fn concat(self) -> Bytes {
        let len = self.fragments.values().map(Bytes::len).sum();
        let mut blob = BytesMut::with_capacity(len);
        for part in self.fragments.into_values() {
            blob.extend_from_slice(&part);
        }
        blob.freeze()
    }
}

/// What happened to one data frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Accepted {
    /// Stored; more fragments are needed.
    Pending,
    /// A copy of this fragment was already held; the new one is dropped.
    Duplicate,
    /// Disagrees with what the record already knows about the total.
    Inconsistent,
    /// Every fragment is present. The record is gone.
    Complete(Bytes),
}

#[derive(Default)]
pub struct Reassembler {
    records: HashMap<MessageKey, Record>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, frame: DataFrame, now: Instant) -> Accepted {
        let key = frame.key;

        // Fragment 1 flagged LAST is the whole blob. It supersedes any
        // partial record, whatever fragmentation that record came from.
        if frame.fragment_num == 1 && frame.last {
            if let Some(partial) = self.records.remove(&key) {
                tracing::debug!(
                    message = %key,
                    held = partial.fragments.len(),
                    "whole blob replaces partial record"
                );
            }
            return Accepted::Complete(frame.payload);
        }

        let record = self.records.entry(key).or_insert_with(|| Record::new(now));

        if let Some(total) = record.total {
            if frame.fragment_num > total || (frame.last && frame.fragment_num != total) {
                tracing::warn!(
                    message = %key,
                    fragment = frame.fragment_num,
                    total,
                    "fragment disagrees with known total, dropped"
                );
                return Accepted::Inconsistent;
            }
        } else if frame.last {
            if let Some((&highest, _)) = record.fragments.last_key_value() {
                if highest > frame.fragment_num {
                    tracing::warn!(
                        message = %key,
                        fragment = frame.fragment_num,
                        highest,
                        "last fragment below one already held, dropped"
                    );
                    return Accepted::Inconsistent;
                }
            }
        }

        if record.fragments.contains_key(&frame.fragment_num) {
            tracing::warn!(
                message = %key,
                fragment = frame.fragment_num,
                "duplicate fragment dropped"
            );
            return Accepted::Duplicate;
        }

        // Only accepted fragments move the record forward or keep it alive.
        if frame.last {
            record.total = Some(frame.fragment_num);
        }
        record.last_seen = now;
        record.fragments.insert(frame.fragment_num, frame.payload);

        if !record.is_complete() {
            tracing::trace!(
                message = %key,
                held = record.fragments.len(),
                total = ?record.total,
                "fragment stored"
            );
            return Accepted::Pending;
        }

        match self.records.remove(&key) {
            Some(record) => Accepted::Complete(record.concat()),
            None => Accepted::Pending,
        }
    }

    /// Drop records whose most recent fragment is older than `ttl`.
    /// Returns how many were dropped.
    pub fn evict_stale(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|key, record| {
            let stale = now.saturating_duration_since(record.last_seen) > ttl;
            if stale {
                tracing::warn!(
                    message = %key,
                    held = record.fragments.len(),
                    total = ?record.total,
                    age_secs = now.saturating_duration_since(record.first_seen).as_secs(),
                    "evicting stale partial message"
                );
            }
            !stale
        });
        before - self.records.len()
    }

    pub fn contains(&self, key: MessageKey) -> bool {
        self.records.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
