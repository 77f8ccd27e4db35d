//! # ACK Probe
//!
//! A congestion controller wrapper that leaves every decision to quinn's
//! Cubic and only watches the traffic:
//!
//! ```text
//!   writer ──note_media(seq)──► pending seqs
//!                                   │ on_sent(pn)
//!                                   ▼
//!                              AckCorrelator ◄── on_ack(sent) / on_end_acks
//!                                   │
//!                                   ▼ Vec<AckedPacket>
//!                              mpsc ──► sender task
//! ```
//!
//! quinn reports acknowledgments by send instant rather than packet number,
//! and one transmit pass stamps every packet it builds with the same
//! instant. The probe therefore logs each `on_sent` call with the packet
//! numbers it covers and consumes exactly one packet of the oldest matching
//! entry per acknowledged instant. Media is reported acknowledged only once
//! every packet of its entry has been.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use quinn::congestion::{Controller, ControllerFactory, CubicConfig};
use tokio::sync::mpsc;

use crate::clock::NtpClock;
use crate::correlator::{AckCorrelator, AckedPacket, PendingDatagrams, DEFAULT_MAX_TRACKED};

/// Capacity of the ACK batch channel toward the sender task.
pub const ACK_CHANNEL_CAPACITY: usize = 256;

/// Most packets attributed to a single `on_sent` call.
const MAX_PACKETS_PER_SEND: u64 = 64;

/// One `on_sent` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SentEntry {
    sent: Instant,
    first_packet: u64,
    last_packet: u64,
    /// Packets of this entry not yet acknowledged.
    unacked: u64,
    media: bool,
}

/// Send-instant log used to turn per-instant acknowledgments back into
/// packet numbers.
#[derive(Debug)]
struct SentLog {
    entries: VecDeque<SentEntry>,
    last_packet: Option<u64>,
    capacity: usize,
}

impl SentLog {
    fn with_capacity(capacity: usize) -> Self {
        SentLog {
            entries: VecDeque::new(),
            last_packet: None,
            capacity: capacity.max(1),
        }
    }

    fn record(&mut self, sent: Instant, last_packet: u64, media: bool) {
        let count = match self.last_packet {
            Some(prev) if last_packet > prev => (last_packet - prev).min(MAX_PACKETS_PER_SEND),
            _ => 1,
        };
        self.last_packet = Some(last_packet);
        self.entries.push_back(SentEntry {
            sent,
            first_packet: last_packet + 1 - count,
            last_packet,
            unacked: count,
            media,
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Consume one packet sent at `sent`, no newer than `largest`. Returns
    /// the entry's last packet number once the whole entry is acknowledged
    /// and it carried media.
    fn acknowledge(&mut self, sent: Instant, largest: u64) -> Option<u64> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.sent == sent && e.first_packet <= largest)?;
        let entry = &mut self.entries[idx];
        entry.unacked -= 1;
        if entry.unacked > 0 {
            return None;
        }
        let entry = self.entries.remove(idx)?;
        entry.media.then_some(entry.last_packet)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for SentLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_TRACKED)
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    correlator: AckCorrelator,
    pending: PendingDatagrams,
    sent_log: SentLog,
    acked_now: Vec<Instant>,
    smoothed_rtt: Duration,
    batches_dropped: u64,
}

impl ProbeState {
    fn on_sent(&mut self, now: Instant, last_packet_number: u64) {
        let seqs = self.pending.take();
        let media = !seqs.is_empty();
        if media {
            self.correlator.track(last_packet_number, seqs);
        }
        self.sent_log.record(now, last_packet_number, media);
    }

    fn on_ack(&mut self, sent: Instant, smoothed_rtt: Duration) {
        self.smoothed_rtt = smoothed_rtt;
        self.acked_now.push(sent);
    }

    /// Resolve the instants acknowledged by one ACK frame.
    fn end_acks(&mut self, largest_packet_num_acked: Option<u64>, stamp: u32) -> Option<Vec<AckedPacket>> {
        let largest = largest_packet_num_acked.unwrap_or(u64::MAX);
        let acked = std::mem::take(&mut self.acked_now);
        let packet_numbers: Vec<u64> = acked
            .into_iter()
            .filter_map(|sent| self.sent_log.acknowledge(sent, largest))
            .collect();
        if packet_numbers.is_empty() {
            return None;
        }
        self.correlator
            .on_ack(packet_numbers.into_iter().map(|pn| pn..=pn), self.smoothed_rtt, stamp)
    }
}

#[derive(Debug)]
struct ProbeShared {
    state: Mutex<ProbeState>,
    acks: mpsc::Sender<Vec<AckedPacket>>,
    clock: NtpClock,
}

impl ProbeShared {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Writer-side handle: announces media packets about to enter the QUIC
/// stack.
#[derive(Debug, Clone)]
pub struct AckProbe {
    shared: Arc<ProbeShared>,
}

impl AckProbe {
    /// The media packet `seq` was handed to the connection.
    pub fn note_media(&self, seq: u16) {
        self.shared.lock().pending.push(seq);
    }

    /// The media packet `seq` never reached the connection after all.
    /// Returns false when it was already attributed to a QUIC packet.
    pub fn retract_media(&self, seq: u16) -> bool {
        self.shared.lock().pending.retract(seq)
    }

    /// Media announced but not yet attributed to a QUIC packet.
    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Latest smoothed RTT seen by the congestion controller.
    pub fn smoothed_rtt(&self) -> Duration {
        self.shared.lock().smoothed_rtt
    }

    /// ACK batches dropped because the sender task lagged behind.
    pub fn batches_dropped(&self) -> u64 {
        self.shared.lock().batches_dropped
    }
}

/// Build a probe for one connection: the factory goes into the transport
/// config, the handle to the writer, the receiver to the sender task.
pub fn probe(clock: NtpClock) -> (Arc<ProbeFactory>, AckProbe, mpsc::Receiver<Vec<AckedPacket>>) {
    let (tx, rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);
    let shared = Arc::new(ProbeShared {
        state: Mutex::new(ProbeState::default()),
        acks: tx,
        clock,
    });
    let factory = Arc::new(ProbeFactory {
        inner: Arc::new(CubicConfig::default()),
        shared: shared.clone(),
    });
    (factory, AckProbe { shared }, rx)
}

// ─── Factory ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ProbeFactory {
    inner: Arc<CubicConfig>,
    shared: Arc<ProbeShared>,
}

impl ControllerFactory for ProbeFactory {
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        Box::new(ProbedController {
            inner: self.inner.clone().build(now, current_mtu),
            shared: self.shared.clone(),
        })
    }
}

// ─── Controller ──────────────────────────────────────────────────────────────

struct ProbedController {
    inner: Box<dyn Controller>,
    shared: Arc<ProbeShared>,
}

impl Controller for ProbedController {
    fn on_sent(&mut self, now: Instant, bytes: u64, last_packet_number: u64) {
        self.shared.lock().on_sent(now, last_packet_number);
        self.inner.on_sent(now, bytes, last_packet_number);
    }

    fn on_ack(
        &mut self,
        now: Instant,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &quinn_proto::RttEstimator,
    ) {
        self.shared.lock().on_ack(sent, rtt.get());
        self.inner.on_ack(now, sent, bytes, app_limited, rtt);
    }

    fn on_end_acks(
        &mut self,
        now: Instant,
        in_flight: u64,
        app_limited: bool,
        largest_packet_num_acked: Option<u64>,
    ) {
        let stamp = self.shared.clock.now();
        let batch = self.shared.lock().end_acks(largest_packet_num_acked, stamp);
        if let Some(batch) = batch {
            if self.shared.acks.try_send(batch).is_err() {
                self.shared.lock().batches_dropped += 1;
                tracing::trace!("ack batch dropped");
            }
        }
        self.inner
            .on_end_acks(now, in_flight, app_limited, largest_packet_num_acked);
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        sent: Instant,
        is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
        self.inner
            .on_congestion_event(now, sent, is_persistent_congestion, lost_bytes);
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.inner.on_mtu_update(new_mtu);
    }

    fn window(&self) -> u64 {
        self.inner.window()
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(ProbedController {
            inner: self.inner.clone_box(),
            shared: self.shared.clone(),
        })
    }

    fn initial_window(&self) -> u64 {
        self.inner.initial_window()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::{CcFeedbackReport, MinimalFeedback, NTP_UNITS_PER_ATO};
    use crate::infer::{InferenceConfig, InferencePolicy, InferenceState};

    fn controller(clock: NtpClock) -> (Box<dyn Controller>, AckProbe, mpsc::Receiver<Vec<AckedPacket>>) {
        let (factory, probe, rx) = probe(clock);
        (factory.build(Instant::now(), 1200), probe, rx)
    }

    #[test]
    fn sent_without_media_is_not_tracked() {
        let (mut c, probe, _rx) = controller(NtpClock::new());
        c.on_sent(Instant::now(), 1200, 1);
        assert!(probe.shared.lock().correlator.is_empty());
    }

    #[test]
    fn media_attributed_to_next_packet_number() {
        let (mut c, probe, _rx) = controller(NtpClock::new());
        probe.note_media(10);
        probe.note_media(11);
        c.on_sent(Instant::now(), 1200, 7);
        let state = probe.shared.lock();
        assert_eq!(state.correlator.len(), 1);
        assert!(state.pending.is_empty());
        assert_eq!(state.sent_log.len(), 1);
    }

    const RTT: Duration = Duration::from_millis(30);

    #[test]
    fn shared_send_instant_acks_one_packet_per_ack() {
        let (mut c, probe, mut rx) = controller(NtpClock::new());
        let t = Instant::now();
        probe.note_media(10);
        c.on_sent(t, 1200, 7);
        probe.note_media(11);
        c.on_sent(t, 1200, 8);

        // One packet sent at `t` acknowledged, its sibling lost.
        probe.shared.lock().on_ack(t, RTT);
        c.on_end_acks(Instant::now(), 1200, false, Some(8));

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].seq, 10);
        assert_eq!(batch[0].packet_number, 7);
        assert_eq!(batch[0].smoothed_rtt, RTT);
        assert!(rx.try_recv().is_err());

        let state = probe.shared.lock();
        assert_eq!(state.correlator.len(), 1);
        assert_eq!(state.sent_log.len(), 1);
    }

    #[test]
    fn acknowledged_media_drives_ack_timestamp_inference() {
        let clock = NtpClock::new();
        let (mut c, probe, mut rx) = controller(clock);
        let mut inference = InferenceState::new(InferenceConfig {
            policy: InferencePolicy::AckTimestamp,
            ..Default::default()
        });
        inference.on_transmitted(40, 1200, 0);
        inference.on_transmitted(41, 1200, 0);

        let t = Instant::now();
        probe.note_media(40);
        c.on_sent(t, 1200, 1);
        probe.note_media(41);
        c.on_sent(t, 1200, 2);
        probe.shared.lock().on_ack(t, RTT);
        c.on_end_acks(Instant::now(), 1200, false, Some(2));

        let batch = rx.try_recv().unwrap();
        inference.on_ack_batch(&batch);
        assert!(inference.table().get(40).is_none());
        assert!(inference.table().get(41).is_some());

        // Reported 200 units after the ACK, stamped 1000 units after it.
        let acked_at = batch[0].ack_timestamp;
        let feedback = MinimalFeedback {
            timestamp: acked_at + 1_000,
            seq: 99,
        };
        let bytes = inference.on_minimal_feedback(feedback, acked_at + 200).unwrap();
        let report = CcFeedbackReport::decode(&bytes).unwrap();
        assert_eq!(report.blocks.len(), 1);
        let block = &report.blocks[0];
        assert_eq!(block.begin_seq, 40);
        assert_eq!(block.records.len(), 1);
        assert!(block.records[0].received);
        assert_eq!(block.records[0].arrival_offset, (200 / NTP_UNITS_PER_ATO) as u16);
    }

    #[test]
    fn ack_of_non_media_sibling_is_not_media() {
        let (mut c, probe, mut rx) = controller(NtpClock::new());
        let t = Instant::now();
        c.on_sent(t, 60, 3);
        probe.note_media(20);
        c.on_sent(t, 1200, 4);

        probe.shared.lock().on_ack(t, RTT);
        c.on_end_acks(Instant::now(), 1200, false, Some(4));
        assert!(rx.try_recv().is_err());

        probe.shared.lock().on_ack(t, RTT);
        c.on_end_acks(Instant::now(), 0, false, Some(4));
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.iter().map(|p| p.seq).collect::<Vec<_>>(), vec![20]);
    }

    #[test]
    fn ack_never_reaches_past_largest_acked() {
        let mut state = ProbeState::default();
        let t = Instant::now();
        state.pending.push(5);
        state.on_sent(t, 9);
        state.on_ack(t, RTT);
        assert!(state.end_acks(Some(8), 0).is_none());
        assert_eq!(state.correlator.len(), 1);
    }

    #[test]
    fn multi_packet_send_waits_for_every_packet() {
        let mut log = SentLog::default();
        let t = Instant::now();
        log.record(t, 1, false);
        log.record(t, 4, true);
        // Packets 2..=4 went out in one call.
        assert_eq!(log.acknowledge(t, 4), None);
        assert_eq!(log.acknowledge(t, 4), None);
        assert_eq!(log.acknowledge(t, 4), None);
        assert_eq!(log.acknowledge(t, 4), Some(4));
        assert_eq!(log.len(), 0);
        assert_eq!(log.acknowledge(t, 4), None);
    }

    #[test]
    fn sent_log_is_bounded() {
        let mut log = SentLog::with_capacity(2);
        let t = Instant::now();
        for pn in 0..5 {
            log.record(t, pn, true);
        }
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn retracted_media_is_never_tracked() {
        let (mut c, probe, _rx) = controller(NtpClock::new());
        probe.note_media(30);
        assert!(probe.retract_media(30));
        c.on_sent(Instant::now(), 1200, 2);
        assert!(probe.shared.lock().correlator.is_empty());

        probe.note_media(31);
        c.on_sent(Instant::now(), 1200, 3);
        assert!(!probe.retract_media(31));
    }

    #[test]
    fn window_delegates_to_cubic() {
        let (c, _probe, _rx) = controller(NtpClock::new());
        let cubic = Arc::new(CubicConfig::default()).build(Instant::now(), 1200);
        assert_eq!(c.window(), cubic.window());
        assert_eq!(c.initial_window(), cubic.initial_window());
    }
}
