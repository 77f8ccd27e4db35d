//! # Transport Statistics
//!
//! Sender- and receiver-side counters. Serializable so binaries can log them
//! as JSON.

use serde::Serialize;

use crate::pacer::PacerCounters;

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Counters kept by the sender task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Media packets accepted into the queue.
    pub packets_queued: u64,
    /// Packets handed to the session successfully.
    pub packets_written: u64,
    /// Bytes handed to the session successfully.
    pub bytes_written: u64,
    /// Session writes that failed (packet dropped).
    pub write_errors: u64,
    /// Packets discarded because the queue was full.
    pub queue_overflows: u64,
    /// Packets still queued at shutdown.
    pub dropped_at_shutdown: u64,
    /// Feedback reports passed to the engine.
    pub feedback_applied: u64,
    /// Feedback messages that failed to decode.
    pub feedback_discarded: u64,
    /// Reports synthesised by inference.
    pub inferred_reports: u64,
    /// QUIC ACK batches received from the correlator.
    pub ack_batches: u64,
    /// Pacing timers armed.
    pub timers_armed: u64,
    /// Drain attempts refused by the engine.
    pub blocked: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the pacer's own counters.
    pub fn absorb_pacer(&mut self, counters: &PacerCounters) {
        self.packets_queued = counters.packets_enqueued;
        self.queue_overflows = counters.packets_overflowed;
        self.timers_armed = counters.timers_armed;
        self.blocked = counters.blocked;
    }

    /// Fraction of attempted writes that failed.
    pub fn write_error_rate(&self) -> f64 {
        let attempts = self.packets_written + self.write_errors;
        if attempts == 0 {
            0.0
        } else {
            self.write_errors as f64 / attempts as f64
        }
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Counters kept by the receiving side.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Datagrams that were not valid media packets.
    pub malformed: u64,
    /// Gaps detected in the sequence number space.
    pub sequence_gaps: u64,
    pub feedback_sent: u64,
    pub feedback_errors: u64,
    pub highest_seq: u16,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account a received media packet.
    pub fn on_packet(&mut self, seq: u16, bytes: usize) {
        if self.packets_received > 0 {
            let expected = self.highest_seq.wrapping_add(1);
            let gap = seq.wrapping_sub(expected);
            if gap != 0 && gap < 0x8000 {
                self.sequence_gaps += gap as u64;
            }
            if seq.wrapping_sub(self.highest_seq) < 0x8000 {
                self.highest_seq = seq;
            }
        } else {
            self.highest_seq = seq;
        }
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }
}
