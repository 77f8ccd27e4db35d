//! # QUIC Packet-ACK Correlator
//!
//! Maps outbound QUIC packet numbers to the media sequence numbers they
//! carried. When the QUIC stack reports a packet number as acknowledged the
//! matching record is removed and emitted as an [`AckedPacket`], stamped with
//! the local time and the latest smoothed RTT. Downstream, the inference
//! step uses these stamps to synthesise receive times.
//!
//! Packet numbers that are never acknowledged stay in the map until the
//! connection ends or the map reaches its capacity, at which point the
//! oldest packet numbers are discarded.

use std::collections::{BTreeMap, VecDeque};
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::media::peek_sequence;

/// Default bound on tracked QUIC packets.
pub const DEFAULT_MAX_TRACKED: usize = 16_384;

/// A media packet whose carrying QUIC packet was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckedPacket {
    pub seq: u16,
    /// QUIC packet number that carried it.
    pub packet_number: u64,
    /// Local NTP time the acknowledgment was processed.
    pub ack_timestamp: u32,
    /// Smoothed RTT when the acknowledgment was processed.
    pub smoothed_rtt: Duration,
}

/// Packet-number → media-sequence bookkeeping for one connection.
#[derive(Debug)]
pub struct AckCorrelator {
    packets: BTreeMap<u64, Vec<u16>>,
    max_tracked: usize,
    evicted: u64,
}

impl AckCorrelator {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_TRACKED)
    }

    pub fn with_capacity(max_tracked: usize) -> Self {
        AckCorrelator {
            packets: BTreeMap::new(),
            max_tracked: max_tracked.max(1),
            evicted: 0,
        }
    }

    /// Number of QUIC packets awaiting acknowledgment.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Records dropped because the map was full.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Record a sent QUIC packet carrying the given media datagrams.
    /// Payloads that are not media packets are ignored; a packet carrying
    /// none is not tracked.
    pub fn on_packet_sent<'a, I>(&mut self, packet_number: u64, datagrams: I)
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let seqs: Vec<u16> = datagrams.into_iter().filter_map(peek_sequence).collect();
        self.track(packet_number, seqs);
    }

    /// Record a sent QUIC packet with already-known media sequence numbers.
    pub fn track(&mut self, packet_number: u64, seqs: Vec<u16>) {
        if seqs.is_empty() {
            return;
        }
        while self.packets.len() >= self.max_tracked {
            if self.packets.pop_first().is_none() {
                break;
            }
            self.evicted += 1;
        }
        self.packets.entry(packet_number).or_default().extend(seqs);
    }

    /// Process acknowledged packet-number ranges. Returns the batch of newly
    /// acknowledged media packets, or `None` if no tracked packet was hit.
    pub fn on_ack<I>(&mut self, ranges: I, smoothed_rtt: Duration, now: u32) -> Option<Vec<AckedPacket>>
    where
        I: IntoIterator<Item = RangeInclusive<u64>>,
    {
        let mut batch = Vec::new();
        for range in ranges {
            if range.start() > range.end() {
                continue;
            }
            let hit: Vec<u64> = self.packets.range(range).map(|(pn, _)| *pn).collect();
            for pn in hit {
                if let Some(seqs) = self.packets.remove(&pn) {
                    batch.extend(seqs.into_iter().map(|seq| AckedPacket {
                        seq,
                        packet_number: pn,
                        ack_timestamp: now,
                        smoothed_rtt,
                    }));
                }
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    /// Forget a packet declared lost by the QUIC stack.
    pub fn on_packet_lost(&mut self, packet_number: u64) -> Option<Vec<u16>> {
        self.packets.remove(&packet_number)
    }
}

impl Default for AckCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

/// Media sequence numbers handed to the QUIC stack but not yet attributed to
/// a QUIC packet number.
#[derive(Debug, Default)]
pub struct PendingDatagrams {
    seqs: VecDeque<u16>,
}

impl PendingDatagrams {
    pub fn push(&mut self, seq: u16) {
        self.seqs.push_back(seq);
    }

    /// Withdraw the newest pending `seq`. Returns false if it is not pending.
    pub fn retract(&mut self, seq: u16) -> bool {
        match self.seqs.iter().rposition(|&s| s == seq) {
            Some(idx) => self.seqs.remove(idx).is_some(),
            None => false,
        }
    }

    /// Take every pending sequence number.
    pub fn take(&mut self) -> Vec<u16> {
        self.seqs.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }
}
