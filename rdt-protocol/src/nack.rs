//! Retransmission request scheduling
//!
//! Tracks sequence-number gaps on a receive stream and decides when to request
//! each missing packet again. Entries are keyed by the unwrapped sequence number
//! so ordering survives the 16-bit wrap.

use crate::sequence::{SeqNumber, SeqUnwrapper};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// NACK scheduler configuration
#[derive(Debug, Clone)]
pub struct NackConfig {
    /// Cadence of `process`
    pub process_interval: Duration,
    /// Lower bound on the interval between two requests for the same packet
    pub min_resend_interval: Duration,
    /// Wait before the first request for a newly detected gap
    pub reorder_delay: Duration,
    /// Requests sent per packet before it is declared lost
    pub max_retries: u32,
    /// Packets further behind the newest than this are declared lost
    pub max_packet_age: u16,
    /// Size of the missing set that triggers a reset and keyframe request
    pub max_list_size: usize,
}

impl Default for NackConfig {
    fn default() -> Self {
        NackConfig {
            process_interval: Duration::from_millis(20),
            min_resend_interval: Duration::from_millis(20),
            reorder_delay: Duration::ZERO,
            max_retries: 10,
            max_packet_age: 10_000,
            max_list_size: 1000,
        }
    }
}

/// Output of one processing pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NackBatch {
    /// Packets to request in one NACK, in sequence order
    pub requests: Vec<SeqNumber>,
    /// Packets given up on
    pub lost: Vec<SeqNumber>,
    /// The missing set overflowed; a keyframe is needed to resync
    pub keyframe_needed: bool,
}

impl NackBatch {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.lost.is_empty() && !self.keyframe_needed
    }
}

/// NACK counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NackStats {
    pub requests_sent: u64,
    pub recovered: u64,
    pub lost: u64,
    pub list_overflows: u64,
}

#[derive(Debug, Clone)]
struct NackEntry {
    seq: SeqNumber,
    detected_at: Instant,
    last_sent: Option<Instant>,
    retries: u32,
    expedited: bool,
}

/// Receive-side NACK scheduler
pub struct NackScheduler {
    config: NackConfig,
    unwrapper: SeqUnwrapper,
    newest: Option<i64>,
    entries: BTreeMap<i64, NackEntry>,
    rtt: Duration,
    next_process: Option<Instant>,
    pending_lost: Vec<SeqNumber>,
    keyframe_pending: bool,
    stats: NackStats,
}

impl NackScheduler {
    pub fn new(config: NackConfig) -> Self {
        NackScheduler {
            config,
            unwrapper: SeqUnwrapper::new(),
            newest: None,
            entries: BTreeMap::new(),
            rtt: Duration::ZERO,
            next_process: None,
            pending_lost: Vec::new(),
            keyframe_pending: false,
            stats: NackStats::default(),
        }
    }

    pub fn stats(&self) -> NackStats {
        self.stats
    }

    /// Number of packets currently missing
    pub fn missing_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether a packet is currently tracked as missing
    pub fn is_missing(&self, seq: SeqNumber) -> bool {
        self.entries.contains_key(&self.unwrapper.peek(seq))
    }

    /// Update the round-trip time used for the resend interval
    pub fn set_rtt(&mut self, rtt: Duration) {
        self.rtt = rtt;
    }

    fn resend_interval(&self) -> Duration {
        self.rtt.max(self.config.min_resend_interval)
    }

    /// Record a received packet
    ///
    /// Returns `true` if the packet filled a tracked gap.
    pub fn on_packet(&mut self, seq: SeqNumber, now: Instant) -> bool {
        let unwrapped = self.unwrapper.unwrap(seq);
        let Some(newest) = self.newest else {
            self.newest = Some(unwrapped);
            return false;
        };

        if unwrapped <= newest {
            if self.entries.remove(&unwrapped).is_some() {
                self.stats.recovered += 1;
                tracing::trace!("Recovered packet {}", seq);
                return true;
            }
            return false;
        }

        let max_age = i64::from(self.config.max_packet_age);
        let first_missing = (newest + 1).max(unwrapped - max_age);
        for missing in first_missing..unwrapped {
            self.entries.insert(
                missing,
                NackEntry {
                    seq: SeqNumber::new(missing as u16),
                    detected_at: now,
                    last_sent: None,
                    retries: 0,
                    expedited: false,
                },
            );
        }
        self.newest = Some(unwrapped);

        // Entries that fell out of the age window
        let cutoff = unwrapped - max_age;
        let retained = self.entries.split_off(&cutoff);
        let expired = std::mem::replace(&mut self.entries, retained);
        for entry in expired.into_values() {
            self.pending_lost.push(entry.seq);
        }

        if self.entries.len() > self.config.max_list_size {
            tracing::warn!(
                "NACK list overflow ({} missing), clearing and requesting keyframe",
                self.entries.len()
            );
            self.stats.list_overflows += 1;
            self.pending_lost
                .extend(self.entries.values().map(|entry| entry.seq));
            self.entries.clear();
            self.keyframe_pending = true;
        }
        false
    }

    /// Request the given packets at the next pass without waiting for the
    /// reorder delay
    ///
    /// Packets with a request already outstanding are left alone.
    pub fn expedite(&mut self, seqs: &[SeqNumber]) {
        for seq in seqs {
            let key = self.unwrapper.peek(*seq);
            if let Some(entry) = self.entries.get_mut(&key) {
                if entry.last_sent.is_none() {
                    entry.expedited = true;
                }
            }
        }
    }

    /// Whether a processing pass is due
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_process.map_or(true, |at| now >= at)
    }

    /// When the next processing pass is due
    pub fn next_process_time(&self) -> Option<Instant> {
        self.next_process
    }

    /// Run one processing pass
    pub fn process(&mut self, now: Instant) -> NackBatch {
        self.next_process = Some(now + self.config.process_interval);

        let resend_interval = self.resend_interval();
        let mut batch = NackBatch {
            lost: std::mem::take(&mut self.pending_lost),
            keyframe_needed: std::mem::take(&mut self.keyframe_pending),
            ..Default::default()
        };

        let mut exhausted = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            let due = match entry.last_sent {
                None => {
                    entry.expedited
                        || now.saturating_duration_since(entry.detected_at)
                            >= self.config.reorder_delay
                }
                Some(sent) => now.saturating_duration_since(sent) >= resend_interval,
            };
            if !due {
                continue;
            }
            if entry.retries >= self.config.max_retries {
                exhausted.push(*key);
                continue;
            }
            entry.last_sent = Some(now);
            entry.retries += 1;
            batch.requests.push(entry.seq);
        }

        for key in exhausted {
            if let Some(entry) = self.entries.remove(&key) {
                tracing::debug!(
                    "Giving up on packet {} after {} requests",
                    entry.seq,
                    entry.retries
                );
                batch.lost.push(entry.seq);
            }
        }

        self.stats.requests_sent += batch.requests.len() as u64;
        self.stats.lost += batch.lost.len() as u64;
        if !batch.requests.is_empty() {
            tracing::trace!("NACK batch: {} requests", batch.requests.len());
        }
        batch
    }

    /// Forget all state
    pub fn reset(&mut self) {
        self.entries.clear();
        self.pending_lost.clear();
        self.newest = None;
        self.unwrapper = SeqUnwrapper::new();
        self.keyframe_pending = false;
    }
}
