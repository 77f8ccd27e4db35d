//! # Congestion-Paced Sender (state machine)
//!
//! Pure logic, no I/O and no timers. The owning task feeds it events and
//! acts on what [`Pacer::poll_transmit`] returns:
//!
//! ```text
//!            media / feedback                 timer fired
//!   Idle ───────────────────────► drain ◄──────────────── WaitingOnTimer
//!    ▲                              │                            ▲
//!    │ Blocked / Empty              │ Wait(d) > epsilon          │
//!    └──────────────────────────────┤────────────────────────────┘
//!                                   │ Now
//!                                   ▼
//!                        pop ─► write ─► on_transmitted ─► drain again
//! ```
//!
//! While `WaitingOnTimer`, new media and feedback are absorbed without a
//! drain attempt; the pending timer wakes the pacer. A `Blocked` decision
//! arms nothing: the next media or feedback event retries.

use std::time::Duration;

use crate::engine::{Admission, CongestionEngine};
use crate::media::MediaPacket;
use crate::queue::{PacketQueue, QueueItem};

// ─── Configuration ───────────────────────────────────────────────────────────

/// Pacer configuration.
#[derive(Debug, Clone)]
pub struct PacerConfig {
    /// Stream identifier registered with the engine.
    pub ssrc: u32,
    /// Waits shorter than this are treated as "send now".
    pub epsilon: Duration,
    /// Queue depth at which the oldest packets are discarded.
    pub max_queue_len: usize,
    pub min_rate_bps: f64,
    pub max_rate_bps: f64,
    pub initial_rate_bps: f64,
}

impl Default for PacerConfig {
    fn default() -> Self {
        PacerConfig {
            ssrc: 1,
            epsilon: Duration::from_millis(1),
            max_queue_len: 4096,
            min_rate_bps: 1_000.0,
            max_rate_bps: 2_048_000_000.0,
            initial_rate_bps: 1_000_000.0,
        }
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerState {
    Idle,
    WaitingOnTimer,
    Draining,
}

/// What the owning task should do next.
#[derive(Debug)]
pub enum PollTransmit {
    /// Write this packet, then report it via [`Pacer::on_transmitted`].
    Transmit(QueueItem),
    /// Arm a one-shot timer for this long and call [`Pacer::on_timer`].
    Wait(Duration),
    /// Engine refused; wait for the next media or feedback event.
    Blocked,
    /// Nothing queued.
    Empty,
}

/// Counters kept by the pacer itself.
#[derive(Debug, Clone, Default)]
pub struct PacerCounters {
    pub packets_enqueued: u64,
    pub packets_dequeued: u64,
    pub packets_overflowed: u64,
    pub timers_armed: u64,
    pub blocked: u64,
    pub feedback_applied: u64,
}

// ─── Pacer ───────────────────────────────────────────────────────────────────

pub struct Pacer<E> {
    config: PacerConfig,
    engine: E,
    queue: PacketQueue,
    state: PacerState,
    counters: PacerCounters,
}

impl<E: CongestionEngine> Pacer<E> {
    /// Create a pacer and register its stream with the engine.
    pub fn new(config: PacerConfig, mut engine: E) -> Self {
        engine.register_stream(
            config.ssrc,
            config.min_rate_bps,
            config.max_rate_bps,
            config.initial_rate_bps,
        );
        let queue = PacketQueue::with_capacity(config.max_queue_len.min(1024));
        Pacer {
            config,
            engine,
            queue,
            state: PacerState::Idle,
            counters: PacerCounters::default(),
        }
    }

    pub fn state(&self) -> PacerState {
        self.state
    }

    pub fn queue(&self) -> &PacketQueue {
        &self.queue
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn counters(&self) -> &PacerCounters {
        &self.counters
    }

    pub fn ssrc(&self) -> u32 {
        self.config.ssrc
    }

    /// A media packet arrived. Returns true when a drain attempt is due.
    pub fn on_media(&mut self, packet: MediaPacket, now: u32) -> bool {
        let size = packet.wire_len();
        if self.queue.len() >= self.config.max_queue_len {
            if let Some(dropped) = self.queue.pop() {
                self.counters.packets_overflowed += 1;
                tracing::debug!(seq = dropped.packet.seq, "queue full, dropped oldest packet");
            }
        }
        self.queue.push(QueueItem::new(packet, now));
        self.counters.packets_enqueued += 1;
        self.engine.admit_media_frame(now, self.config.ssrc, size);
        self.state != PacerState::WaitingOnTimer
    }

    /// Feedback bytes arrived. Returns true when a drain attempt is due.
    pub fn on_feedback(&mut self, report: &[u8], now: u32) -> bool {
        self.engine.apply_feedback(now, report);
        self.counters.feedback_applied += 1;
        self.state != PacerState::WaitingOnTimer
    }

    /// The armed pacing timer fired.
    pub fn on_timer(&mut self) {
        self.state = PacerState::Draining;
    }

    /// One drain step.
    pub fn poll_transmit(&mut self, now: u32) -> PollTransmit {
        if self.queue.is_empty() {
            self.state = PacerState::Idle;
            return PollTransmit::Empty;
        }
        let admission = self
            .engine
            .is_ok_to_transmit(now, self.config.ssrc, &self.queue)
            .with_epsilon(self.config.epsilon);
        match admission {
            Admission::Blocked => {
                self.counters.blocked += 1;
                if self.state == PacerState::WaitingOnTimer {
                    self.state = PacerState::Idle;
                }
                PollTransmit::Blocked
            }
            Admission::Wait(d) => self.arm(d),
            Admission::Now => match self.queue.pop() {
                Some(item) => {
                    self.state = PacerState::Draining;
                    self.counters.packets_dequeued += 1;
                    PollTransmit::Transmit(item)
                }
                None => {
                    self.state = PacerState::Idle;
                    PollTransmit::Empty
                }
            },
        }
    }

    /// Report a packet handed to the session. Returns a wait when the engine
    /// asks for spacing before the next packet.
    pub fn on_transmitted(&mut self, item: &QueueItem, now: u32) -> Option<Duration> {
        let admission = self
            .engine
            .record_transmitted(
                now,
                item.packet.ssrc,
                item.size(),
                item.packet.seq,
                item.packet.marker,
            )
            .with_epsilon(self.config.epsilon);
        match admission {
            Admission::Wait(d) if !self.queue.is_empty() => match self.arm(d) {
                PollTransmit::Wait(d) => Some(d),
                _ => None,
            },
            _ => None,
        }
    }

    /// Drop everything still queued. Returns the number discarded.
    pub fn clear(&mut self) -> usize {
        self.state = PacerState::Idle;
        self.queue.clear()
    }

    fn arm(&mut self, d: Duration) -> PollTransmit {
        self.state = PacerState::WaitingOnTimer;
        self.counters.timers_armed += 1;
        PollTransmit::Wait(d)
    }
}
