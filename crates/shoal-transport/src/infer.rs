//! # Receive-Time Inference
//!
//! When the receiver only reports the newest packet it saw (a
//! [`MinimalFeedback`]) or reports nothing and the QUIC stack's
//! acknowledgments stand in for it, the sender synthesises a full CC feedback
//! report itself. Each pending packet gets an inferred receive time from one
//! of three policies, and the inferred arrivals go through a sender-side
//! [`FeedbackBuilder`] so the engine sees the same report format as with
//! direct feedback.
//!
//! Every policy clamps its result into `[sent, reference]`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

use crate::clock::duration_to_ntp;
use crate::correlator::AckedPacket;
use crate::error::ConfigError;
use crate::feedback::{FeedbackBuilder, MinimalFeedback};

// ─── Policies ────────────────────────────────────────────────────────────────

/// Default static delay offset (NTP units).
pub const DEFAULT_STATIC_OFFSET: u32 = 100;

/// Default static delay window (NTP units).
pub const DEFAULT_STATIC_WINDOW: u32 = 1000;

/// Heuristic converting a sent record and a reference timestamp into a
/// plausible receive time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferencePolicy {
    /// `reference - offset`, but no later than `sent + window`.
    StaticDelay { offset: u32, window: u32 },
    /// `reference` minus time elapsed since the QUIC ACK for the packet.
    AckTimestamp,
    /// `sent + srtt / 2`.
    RttBased,
}

impl InferencePolicy {
    pub fn static_delay() -> Self {
        InferencePolicy::StaticDelay {
            offset: DEFAULT_STATIC_OFFSET,
            window: DEFAULT_STATIC_WINDOW,
        }
    }

    /// Inferred receive time for `record`, given the feedback `reference`
    /// timestamp and the local time `now`.
    pub fn infer(&self, record: &SentPacketRecord, reference: u32, now: u32) -> u32 {
        let sent = record.sent_timestamp;
        let candidate = match *self {
            InferencePolicy::StaticDelay { offset, window } => reference
                .saturating_sub(offset)
                .min(sent.saturating_add(window)),
            InferencePolicy::AckTimestamp => {
                let acked_at = record.ack_timestamp.unwrap_or(now);
                let since_ack = now.saturating_sub(acked_at);
                reference.saturating_sub(since_ack)
            }
            InferencePolicy::RttBased => {
                let half_rtt = duration_to_ntp(record.smoothed_rtt.unwrap_or_default()) / 2;
                sent.saturating_add(half_rtt)
            }
        };
        clamp(candidate, sent, reference)
    }
}

fn clamp(t: u32, lo: u32, hi: u32) -> u32 {
    if t < lo {
        lo
    } else if t > hi {
        hi.max(lo)
    } else {
        t
    }
}

// ─── Feedback mode ───────────────────────────────────────────────────────────

/// How the sender acquires feedback for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackMode {
    /// Receiver sends full CC feedback reports.
    Receive,
    /// Sender infers reports with the given policy.
    Infer(InferencePolicy),
}

impl FeedbackMode {
    pub fn is_inferred(&self) -> bool {
        matches!(self, FeedbackMode::Infer(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackMode::Receive => "receive",
            FeedbackMode::Infer(InferencePolicy::StaticDelay { .. }) => "static-delay",
            FeedbackMode::Infer(InferencePolicy::AckTimestamp) => "ack-timestamp",
            FeedbackMode::Infer(InferencePolicy::RttBased) => "rtt",
        }
    }
}

impl Default for FeedbackMode {
    fn default() -> Self {
        FeedbackMode::Receive
    }
}

impl fmt::Display for FeedbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "receive" => Ok(FeedbackMode::Receive),
            "static-delay" => Ok(FeedbackMode::Infer(InferencePolicy::static_delay())),
            "ack-timestamp" => Ok(FeedbackMode::Infer(InferencePolicy::AckTimestamp)),
            "rtt" => Ok(FeedbackMode::Infer(InferencePolicy::RttBased)),
            other => Err(ConfigError::UnknownVariant {
                field: "feedback.mode",
                value: other.to_string(),
            }),
        }
    }
}

// ─── Sent packet table ───────────────────────────────────────────────────────

/// Bookkeeping for one transmitted media packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentPacketRecord {
    pub seq: u16,
    pub sent_timestamp: u32,
    pub size: usize,
    pub ack_timestamp: Option<u32>,
    pub smoothed_rtt: Option<Duration>,
}

impl SentPacketRecord {
    pub fn new(seq: u16, sent_timestamp: u32, size: usize) -> Self {
        SentPacketRecord {
            seq,
            sent_timestamp,
            size,
            ack_timestamp: None,
            smoothed_rtt: None,
        }
    }
}

/// Sent records keyed by media sequence number.
///
/// Bounded two ways: at most `capacity` records (oldest evicted first), and
/// no record older than `max_age` relative to the newest insert.
#[derive(Debug)]
pub struct SentPacketTable {
    records: HashMap<u16, SentPacketRecord>,
    order: VecDeque<(u16, u32)>,
    capacity: usize,
    max_age: u32,
    evicted: u64,
}

impl SentPacketTable {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        SentPacketTable {
            records: HashMap::with_capacity(capacity.min(4096)),
            order: VecDeque::new(),
            capacity: capacity.clamp(1, u16::MAX as usize),
            max_age: duration_to_ntp(max_age).max(1),
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn get(&self, seq: u16) -> Option<&SentPacketRecord> {
        self.records.get(&seq)
    }

    /// Insert a record, replacing any older record for the same sequence
    /// number, and evict expired ones.
    pub fn insert(&mut self, record: SentPacketRecord) {
        let now = record.sent_timestamp;
        self.records.insert(record.seq, record);
        self.order.push_back((record.seq, record.sent_timestamp));
        self.evict(now);
    }

    /// Remove and return the record for `seq`.
    pub fn take(&mut self, seq: u16) -> Option<SentPacketRecord> {
        self.records.remove(&seq)
    }

    fn evict(&mut self, now: u32) {
        while let Some(&(seq, sent)) = self.order.front() {
            let live = self
                .records
                .get(&seq)
                .is_some_and(|r| r.sent_timestamp == sent);
            if !live {
                // Consumed or superseded by a wrapped sequence number.
                self.order.pop_front();
                continue;
            }
            let expired = now.saturating_sub(sent) > self.max_age;
            if !expired && self.records.len() <= self.capacity {
                break;
            }
            self.order.pop_front();
            self.records.remove(&seq);
            self.evicted += 1;
        }
    }
}

// ─── Inference state ─────────────────────────────────────────────────────────

/// Tunables for [`InferenceState`].
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub policy: InferencePolicy,
    pub ssrc: u32,
    pub table_capacity: usize,
    pub max_record_age: Duration,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        InferenceConfig {
            policy: InferencePolicy::static_delay(),
            ssrc: 1,
            table_capacity: 8192,
            max_record_age: Duration::from_secs(10),
        }
    }
}

/// Sender-side owner of every sent record. Lives inside the sender task so
/// the table has a single owner.
#[derive(Debug)]
pub struct InferenceState {
    policy: InferencePolicy,
    ssrc: u32,
    table: SentPacketTable,
    awaiting_receive: Vec<SentPacketRecord>,
    last_smoothed_rtt: Duration,
    builder: FeedbackBuilder,
    reports_built: u64,
}

impl InferenceState {
    pub fn new(config: InferenceConfig) -> Self {
        InferenceState {
            policy: config.policy,
            ssrc: config.ssrc,
            table: SentPacketTable::new(config.table_capacity, config.max_record_age),
            awaiting_receive: Vec::new(),
            last_smoothed_rtt: Duration::ZERO,
            builder: FeedbackBuilder::new(config.ssrc),
            reports_built: 0,
        }
    }

    pub fn policy(&self) -> InferencePolicy {
        self.policy
    }

    pub fn table(&self) -> &SentPacketTable {
        &self.table
    }

    pub fn reports_built(&self) -> u64 {
        self.reports_built
    }

    /// A media packet was written at `now`.
    pub fn on_transmitted(&mut self, seq: u16, size: usize, now: u32) {
        self.table.insert(SentPacketRecord::new(seq, now, size));
    }

    /// QUIC acknowledged some media packets.
    pub fn on_ack_batch(&mut self, batch: &[AckedPacket]) {
        for acked in batch {
            self.last_smoothed_rtt = acked.smoothed_rtt;
            if let Some(mut record) = self.table.take(acked.seq) {
                record.ack_timestamp = Some(acked.ack_timestamp);
                record.smoothed_rtt = Some(acked.smoothed_rtt);
                self.awaiting_receive.push(record);
            }
        }
    }

    /// The receiver reported its newest packet. Infers receive times for
    /// everything pending and returns an encoded CC feedback report stamped
    /// with the receiver's timestamp.
    pub fn on_minimal_feedback(&mut self, feedback: MinimalFeedback, now: u32) -> Option<Bytes> {
        let reference = feedback.timestamp;
        if let Some(mut record) = self.table.take(feedback.seq) {
            record.ack_timestamp = Some(reference);
            record.smoothed_rtt = Some(self.last_smoothed_rtt);
            self.awaiting_receive.push(record);
        }

        for record in self.awaiting_receive.drain(..) {
            let receive_time = self.policy.infer(&record, reference, now);
            self.builder.record(self.ssrc, record.seq, receive_time, 0);
        }

        let report = self.builder.build(reference)?;
        match report.to_bytes() {
            Ok(bytes) => {
                self.reports_built += 1;
                Some(bytes)
            }
            Err(e) => {
                tracing::warn!(error = %e, "inferred feedback report could not be encoded");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::CcFeedbackReport;

    fn record(sent: u32) -> SentPacketRecord {
        SentPacketRecord::new(1, sent, 100)
    }

    // ─── Policies ───────────────────────────────────────────────────────

    #[test]
    fn static_delay_subtracts_offset() {
        let p = InferencePolicy::static_delay();
        assert_eq!(p.infer(&record(1_000), 1_500, 0), 1_400);
    }

    #[test]
    fn static_delay_bounded_by_window() {
        let p = InferencePolicy::static_delay();
        assert_eq!(p.infer(&record(1_000), 10_000, 0), 2_000);
    }

    #[test]
    fn static_delay_never_before_sent() {
        let p = InferencePolicy::static_delay();
        assert_eq!(p.infer(&record(1_000), 1_050, 0), 1_000);
        assert_eq!(p.infer(&record(50), 60, 0), 50);
    }

    #[test]
    fn ack_timestamp_subtracts_time_since_ack() {
        let mut r = record(1_000);
        r.ack_timestamp = Some(5_000);
        assert_eq!(InferencePolicy::AckTimestamp.infer(&r, 6_000, 5_300), 5_700);
        // Long ago: clamped to sent.
        assert_eq!(InferencePolicy::AckTimestamp.infer(&r, 6_000, 20_000), 1_000);
    }

    #[test]
    fn rtt_adds_half_rtt() {
        let mut r = record(65_536);
        r.smoothed_rtt = Some(Duration::from_millis(500));
        // Half of 0.5 s in NTP units is 16384.
        assert_eq!(InferencePolicy::RttBased.infer(&r, 200_000, 0), 81_920);
        assert_eq!(InferencePolicy::RttBased.infer(&r, 70_000, 0), 70_000);
    }

    #[test]
    fn rtt_without_sample_uses_sent() {
        let r = record(1_000);
        assert_eq!(InferencePolicy::RttBased.infer(&r, 2_000, 0), 1_000);
    }

    #[test]
    fn feedback_mode_parse() {
        assert_eq!("receive".parse::<FeedbackMode>().unwrap(), FeedbackMode::Receive);
        assert_eq!(
            "ack-timestamp".parse::<FeedbackMode>().unwrap(),
            FeedbackMode::Infer(InferencePolicy::AckTimestamp)
        );
        assert_eq!("rtt".parse::<FeedbackMode>().unwrap().to_string(), "rtt");
        assert!("bogus".parse::<FeedbackMode>().is_err());
    }

    // ─── Table ──────────────────────────────────────────────────────────

    #[test]
    fn table_evicts_by_capacity() {
        let mut t = SentPacketTable::new(3, Duration::from_secs(60));
        for seq in 0..5u16 {
            t.insert(SentPacketRecord::new(seq, seq as u32, 10));
        }
        assert_eq!(t.len(), 3);
        assert!(t.get(0).is_none());
        assert!(t.get(1).is_none());
        assert!(t.get(4).is_some());
        assert_eq!(t.evicted(), 2);
    }

    #[test]
    fn table_evicts_by_age() {
        let mut t = SentPacketTable::new(100, Duration::from_secs(1));
        t.insert(SentPacketRecord::new(1, 0, 10));
        t.insert(SentPacketRecord::new(2, 30_000, 10));
        t.insert(SentPacketRecord::new(3, 70_000, 10));
        assert!(t.get(1).is_none());
        assert!(t.get(2).is_some());
        assert!(t.get(3).is_some());
    }

    #[test]
    fn table_reinsert_after_wrap_keeps_newest() {
        let mut t = SentPacketTable::new(2, Duration::from_secs(60));
        t.insert(SentPacketRecord::new(7, 10, 10));
        t.insert(SentPacketRecord::new(7, 20, 10));
        t.insert(SentPacketRecord::new(8, 30, 10));
        assert_eq!(t.get(7).map(|r| r.sent_timestamp), Some(20));
        assert_eq!(t.len(), 2);
    }

    // ─── State ──────────────────────────────────────────────────────────

    #[test]
    fn minimal_feedback_produces_report() {
        let mut s = InferenceState::new(InferenceConfig::default());
        s.on_transmitted(10, 100, 1_000);
        s.on_transmitted(11, 100, 1_100);
        let fb = MinimalFeedback {
            timestamp: 1_500,
            seq: 11,
        };
        let bytes = s.on_minimal_feedback(fb, 1_600).unwrap();
        let report = CcFeedbackReport::decode(&bytes).unwrap();
        assert_eq!(report.report_timestamp, 1_500);
        assert_eq!(report.blocks.len(), 1);
        assert_eq!(report.blocks[0].begin_seq, 11);
        assert!(report.blocks[0].records[0].received);
        assert_eq!(s.reports_built(), 1);
        // Record consumed.
        assert!(s.table().get(11).is_none());
        assert!(s.table().get(10).is_some());
    }

    #[test]
    fn acked_packets_join_next_report() {
        let config = InferenceConfig {
            policy: InferencePolicy::AckTimestamp,
            ..Default::default()
        };
        let mut s = InferenceState::new(config);
        for seq in 0..3u16 {
            s.on_transmitted(seq, 100, 1_000 + seq as u32);
        }
        let batch: Vec<AckedPacket> = (0..2u16)
            .map(|seq| AckedPacket {
                seq,
                packet_number: seq as u64,
                ack_timestamp: 2_000,
                smoothed_rtt: Duration::from_millis(30),
            })
            .collect();
        s.on_ack_batch(&batch);
        let bytes = s
            .on_minimal_feedback(MinimalFeedback { timestamp: 3_000, seq: 2 }, 2_100)
            .unwrap();
        let report = CcFeedbackReport::decode(&bytes).unwrap();
        let block = &report.blocks[0];
        assert_eq!(block.begin_seq, 0);
        assert_eq!(block.num_reports, 3);
        assert!(block.records.iter().all(|r| r.received));
        assert!(s.table().is_empty());
    }

    #[test]
    fn unknown_minimal_feedback_yields_nothing() {
        let mut s = InferenceState::new(InferenceConfig::default());
        assert!(s
            .on_minimal_feedback(MinimalFeedback { timestamp: 10, seq: 3 }, 10)
            .is_none());
    }
}
