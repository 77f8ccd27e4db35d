//! # Media Receiver
//!
//! Client side of a session. The ingress loop decodes media, hands it to the
//! [`MediaSink`] and reports each arrival to the feedback reporter task:
//!
//! ```text
//!   MediaIngress ──► decode ──► MediaSink
//!                        │
//!                        └─ (ssrc, seq, arrival) ──► reporter ──► FeedbackEgress
//!                                                     ▲
//!                                               tick ─┘
//! ```
//!
//! The reporter either sends full CC feedback reports or, for senders that
//! infer feedback themselves, a [`MinimalFeedback`] naming the newest packet.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::clock::NtpClock;
use crate::error::SessionError;
use crate::feedback::{FeedbackBuilder, MinimalFeedback};
use crate::media::{MediaPacket, MediaSink};
use crate::session::{ClientSession, FeedbackEgress};
use crate::shutdown::ShutdownSignal;
use crate::stats::ReceiverStats;

/// Default feedback interval.
pub const DEFAULT_FEEDBACK_INTERVAL: Duration = Duration::from_millis(10);

// ─── Reporter ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterMode {
    /// Full CC feedback every `interval`, and after every packet when
    /// `immediate` is set.
    Full { interval: Duration, immediate: bool },
    /// `(arrival timestamp, sequence)` of the newest packet every `interval`.
    Minimal { interval: Duration },
}

impl ReporterMode {
    pub fn interval(&self) -> Duration {
        match *self {
            ReporterMode::Full { interval, .. } | ReporterMode::Minimal { interval } => interval,
        }
    }
}

impl Default for ReporterMode {
    fn default() -> Self {
        ReporterMode::Full {
            interval: DEFAULT_FEEDBACK_INTERVAL,
            immediate: false,
        }
    }
}

/// Turns arrivals into feedback messages. No I/O.
#[derive(Debug)]
pub struct FeedbackReporter {
    mode: ReporterMode,
    builder: FeedbackBuilder,
    newest: Option<MinimalFeedback>,
}

impl FeedbackReporter {
    pub fn new(mode: ReporterMode, sender_ssrc: u32) -> Self {
        FeedbackReporter {
            mode,
            builder: FeedbackBuilder::new(sender_ssrc),
            newest: None,
        }
    }

    /// A packet arrived. Returns a message to send right away, if any.
    pub fn on_arrival(&mut self, ssrc: u32, seq: u16, arrival: u32) -> Option<Bytes> {
        match self.mode {
            ReporterMode::Full { immediate, .. } => {
                self.builder.record(ssrc, seq, arrival, 0);
                if immediate {
                    self.full_report(arrival)
                } else {
                    None
                }
            }
            ReporterMode::Minimal { .. } => {
                self.newest = Some(MinimalFeedback {
                    timestamp: arrival,
                    seq,
                });
                None
            }
        }
    }

    /// The feedback interval elapsed. Returns the message to send, if
    /// anything arrived since the last one.
    pub fn on_tick(&mut self, now: u32) -> Option<Bytes> {
        match self.mode {
            ReporterMode::Full { .. } => self.full_report(now),
            ReporterMode::Minimal { .. } => self.newest.take().map(|m| m.to_bytes()),
        }
    }

    fn full_report(&mut self, now: u32) -> Option<Bytes> {
        let report = self.builder.build(now)?;
        match report.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(error = %e, "feedback report could not be encoded");
                None
            }
        }
    }
}

// ─── Runtime ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// SSRC placed in outgoing feedback reports.
    pub ssrc: u32,
    pub mode: ReporterMode,
    pub channel_capacity: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            ssrc: 2,
            mode: ReporterMode::default(),
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Arrival {
    ssrc: u32,
    seq: u16,
    at: u32,
}

#[derive(Debug, Default)]
struct ReporterCounters {
    sent: u64,
    errors: u64,
}

/// Receive media until the sender ends the stream, shutdown, or a session
/// failure.
pub async fn run_receiver<S: MediaSink>(
    session: ClientSession,
    config: ReceiverConfig,
    mut sink: S,
    clock: NtpClock,
    mut shutdown: ShutdownSignal,
) -> Result<ReceiverStats, SessionError> {
    let ClientSession {
        kind,
        mut ingress,
        feedback,
        closer,
    } = session;
    tracing::info!(%kind, mode = ?config.mode, "receiver started");

    let (arrivals_tx, arrivals_rx) = mpsc::channel(config.channel_capacity.max(1));
    let reporter = tokio::spawn(run_reporter(
        FeedbackReporter::new(config.mode, config.ssrc),
        config.mode.interval(),
        feedback,
        arrivals_rx,
        clock,
        shutdown.clone(),
    ));

    let mut stats = ReceiverStats::new();
    let outcome = loop {
        let next = tokio::select! {
            _ = shutdown.wait() => break Ok(()),
            next = ingress.next() => next,
        };
        let datagram = match next {
            Ok(Some(datagram)) => datagram,
            Ok(None) => {
                tracing::info!("sender ended the stream");
                break Ok(());
            }
            Err(e) => break Err(e),
        };
        let at = clock.now();
        let packet = match MediaPacket::decode(&datagram) {
            Ok(packet) => packet,
            Err(e) => {
                stats.malformed += 1;
                tracing::debug!(error = %e, len = datagram.len(), "malformed media packet");
                continue;
            }
        };
        stats.on_packet(packet.seq, datagram.len());
        let arrival = Arrival {
            ssrc: packet.ssrc,
            seq: packet.seq,
            at,
        };
        sink.consume(packet);
        if arrivals_tx.try_send(arrival).is_err() {
            tracing::trace!(seq = arrival.seq, "reporter lagging, arrival not reported");
        }
    };

    drop(arrivals_tx);
    match reporter.await {
        Ok(counters) => {
            stats.feedback_sent = counters.sent;
            stats.feedback_errors = counters.errors;
        }
        Err(e) => tracing::warn!(error = %e, "feedback reporter task failed"),
    }
    closer.close();
    tracing::info!(
        packets = stats.packets_received,
        bytes = stats.bytes_received,
        gaps = stats.sequence_gaps,
        feedback_sent = stats.feedback_sent,
        "receiver stopped"
    );
    outcome.map(|()| stats)
}

async fn run_reporter(
    mut reporter: FeedbackReporter,
    interval: Duration,
    mut egress: FeedbackEgress,
    mut arrivals: mpsc::Receiver<Arrival>,
    clock: NtpClock,
    mut shutdown: ShutdownSignal,
) -> ReporterCounters {
    let mut counters = ReporterCounters::default();
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let message = tokio::select! {
            _ = shutdown.wait() => break,
            arrival = arrivals.recv() => match arrival {
                Some(a) => reporter.on_arrival(a.ssrc, a.seq, a.at),
                None => break,
            },
            _ = ticker.tick() => reporter.on_tick(clock.now()),
        };
        let Some(message) = message else { continue };
        match egress.send(message).await {
            Ok(()) => counters.sent += 1,
            Err(e) if e.is_fatal() => {
                if !e.is_clean_close() {
                    tracing::warn!(error = %e, "feedback session failed");
                }
                break;
            }
            Err(e) => {
                counters.errors += 1;
                tracing::debug!(error = %e, "feedback send failed");
            }
        }
    }
    counters
}
