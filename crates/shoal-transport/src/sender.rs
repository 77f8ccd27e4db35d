//! # Paced Sender Task
//!
//! Async owner of the [`Pacer`], the session writer and the inference state.
//! Every input reaches it through a bounded channel:
//!
//! ```text
//!   media ─────────┐
//!   feedback ──────┤                    ┌──► PacketWriter::write
//!   ack batches ───┼──► select! loop ───┤
//!   engine queries ┤     (one task)     └──► reply (target, stats)
//!   pacing timer ──┤
//!   shutdown ──────┘
//! ```
//!
//! The engine and the sent-record table have a single owner, so the bitrate
//! loop reads engine state through [`EngineQueries`] instead of sharing it.
//!
//! On shutdown the task stops taking media, keeps draining under admission
//! control until the queue is empty or the grace period ends, then closes
//! the writer.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::clock::NtpClock;
use crate::correlator::AckedPacket;
use crate::engine::CongestionEngine;
use crate::error::SessionError;
use crate::feedback::{CcFeedbackReport, MinimalFeedback};
use crate::infer::{FeedbackMode, InferenceConfig, InferenceState};
use crate::media::MediaPacket;
use crate::pacer::{Pacer, PacerConfig, PacerState, PollTransmit};
use crate::session::PacketWriter;
use crate::shutdown::ShutdownSignal;
use crate::stats::SenderStats;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub pacer: PacerConfig,
    pub feedback_mode: FeedbackMode,
    /// Table bounds for inference modes. The policy comes from
    /// `feedback_mode`.
    pub inference: InferenceConfig,
    /// Longest time spent draining the queue after shutdown.
    pub shutdown_grace: Duration,
    /// Capacity of the media and feedback channels.
    pub channel_capacity: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            pacer: PacerConfig::default(),
            feedback_mode: FeedbackMode::Receive,
            inference: InferenceConfig::default(),
            shutdown_grace: Duration::from_secs(2),
            channel_capacity: 1024,
        }
    }
}

// ─── Engine queries ──────────────────────────────────────────────────────────

/// Engine state read by the bitrate loop.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub target_bps: f64,
    pub queue_len: usize,
    /// `statistics_snapshot` output, when requested.
    pub statistics: Option<String>,
}

#[derive(Debug)]
struct EngineQuery {
    with_statistics: bool,
    reply: oneshot::Sender<EngineSnapshot>,
}

/// Cloneable handle for reading engine state from other tasks.
#[derive(Debug, Clone)]
pub struct EngineQueries {
    tx: mpsc::Sender<EngineQuery>,
}

impl EngineQueries {
    /// Ask the sender task for a snapshot. `None` once the task has ended.
    pub async fn snapshot(&self, with_statistics: bool) -> Option<EngineSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineQuery {
                with_statistics,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()
    }
}

/// Inputs of a running sender. Fields are handed to different tasks.
#[derive(Debug)]
pub struct SenderHandle {
    /// Media packets in. Dropping every clone starts shutdown.
    pub media: mpsc::Sender<MediaPacket>,
    /// Raw feedback messages in, from the session's feedback reader.
    pub feedback: mpsc::Sender<Bytes>,
    pub queries: EngineQueries,
}

// ─── Sender ──────────────────────────────────────────────────────────────────

pub struct PacedSender<E, W> {
    pacer: Pacer<E>,
    writer: W,
    clock: NtpClock,
    mode: FeedbackMode,
    inference: Option<InferenceState>,
    media_rx: mpsc::Receiver<MediaPacket>,
    feedback_rx: mpsc::Receiver<Bytes>,
    ack_rx: Option<mpsc::Receiver<Vec<AckedPacket>>>,
    query_rx: mpsc::Receiver<EngineQuery>,
    shutdown: ShutdownSignal,
    grace: Duration,
    pacing_deadline: Option<Instant>,
    stats: SenderStats,
}

impl<E, W> PacedSender<E, W>
where
    E: CongestionEngine,
    W: PacketWriter,
{
    /// Build a sender. `acks` carries QUIC acknowledgment batches and is only
    /// consulted in inference modes; `clock` must be the clock that stamped
    /// them.
    pub fn new(
        config: SenderConfig,
        engine: E,
        writer: W,
        clock: NtpClock,
        acks: Option<mpsc::Receiver<Vec<AckedPacket>>>,
        shutdown: ShutdownSignal,
    ) -> (Self, SenderHandle) {
        let capacity = config.channel_capacity.max(1);
        let (media_tx, media_rx) = mpsc::channel(capacity);
        let (feedback_tx, feedback_rx) = mpsc::channel(capacity);
        let (query_tx, query_rx) = mpsc::channel(16);

        let inference = match config.feedback_mode {
            FeedbackMode::Infer(policy) => Some(InferenceState::new(InferenceConfig {
                policy,
                ssrc: config.pacer.ssrc,
                ..config.inference
            })),
            FeedbackMode::Receive => None,
        };

        let sender = PacedSender {
            pacer: Pacer::new(config.pacer, engine),
            writer,
            clock,
            mode: config.feedback_mode,
            inference,
            media_rx,
            feedback_rx,
            ack_rx: acks,
            query_rx,
            shutdown,
            grace: config.shutdown_grace,
            pacing_deadline: None,
            stats: SenderStats::new(),
        };
        let handle = SenderHandle {
            media: media_tx,
            feedback: feedback_tx,
            queries: EngineQueries { tx: query_tx },
        };
        (sender, handle)
    }

    /// Run until shutdown (or media input closes) and the queue is flushed,
    /// or until the session fails.
    pub async fn run(mut self) -> SenderStats {
        tracing::info!(
            ssrc = self.pacer.ssrc(),
            feedback_mode = %self.mode,
            "paced sender started"
        );

        let outcome = self.event_loop().await;
        if let Err(e) = &outcome {
            tracing::warn!(error = %e, "session failed, sender stopping");
        }

        self.stats.dropped_at_shutdown += self.pacer.clear() as u64;
        if outcome.is_ok() {
            if let Err(e) = self.writer.close().await {
                tracing::debug!(error = %e, "session close failed");
            }
        }

        self.stats.absorb_pacer(self.pacer.counters());
        if let Some(inference) = &self.inference {
            self.stats.inferred_reports = inference.reports_built();
        }
        tracing::info!(
            written = self.stats.packets_written,
            bytes = self.stats.bytes_written,
            write_errors = self.stats.write_errors,
            dropped = self.stats.dropped_at_shutdown,
            "paced sender stopped"
        );
        self.stats
    }

    async fn event_loop(&mut self) -> Result<(), SessionError> {
        let mut grace_deadline: Option<Instant> = None;
        loop {
            if grace_deadline.is_some() && self.pacer.queue().is_empty() {
                return Ok(());
            }
            let pacing = self.pacing_deadline;
            let draining_out = grace_deadline.is_some();

            // Biased: a query is answered only after every input queued
            // ahead of it has been handled.
            tokio::select! {
                biased;

                _ = self.shutdown.wait(), if !draining_out => {
                    match self.shut_down().await? {
                        Some(deadline) => grace_deadline = Some(deadline),
                        None => return Ok(()),
                    }
                }
                _ = sleep_until_opt(pacing) => {
                    self.pacing_deadline = None;
                    self.pacer.on_timer();
                    if !self.drain_until(grace_deadline).await? {
                        return Ok(());
                    }
                }
                Some(feedback) = self.feedback_rx.recv() => {
                    if self.on_feedback(feedback) && !self.drain_until(grace_deadline).await? {
                        return Ok(());
                    }
                }
                Some(batch) = recv_or_pending(&mut self.ack_rx) => {
                    self.on_ack_batch(&batch);
                }
                media = self.media_rx.recv(), if !draining_out => match media {
                    Some(packet) => {
                        if self.pacer.on_media(packet, self.clock.now()) {
                            self.drain().await?;
                        }
                    }
                    None => {
                        tracing::debug!("media input closed");
                        match self.shut_down().await? {
                            Some(deadline) => grace_deadline = Some(deadline),
                            None => return Ok(()),
                        }
                    }
                },
                Some(query) = self.query_rx.recv() => {
                    self.answer(query);
                }
                _ = sleep_until_opt(grace_deadline) => {
                    tracing::debug!(
                        remaining = self.pacer.queue().len(),
                        "shutdown grace period elapsed"
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Stop taking media and flush the queue under admission control.
    /// Returns the grace deadline, or `None` when it passed mid-drain. An
    /// armed pacing timer keeps its schedule.
    async fn shut_down(&mut self) -> Result<Option<Instant>, SessionError> {
        let deadline = self.begin_shutdown();
        if self.pacer.state() == PacerState::WaitingOnTimer {
            return Ok(Some(deadline));
        }
        Ok(self.drain_until(Some(deadline)).await?.then_some(deadline))
    }

    /// Pull what is already buffered into the pacer queue.
    fn begin_shutdown(&mut self) -> Instant {
        self.media_rx.close();
        let now = self.clock.now();
        while let Ok(packet) = self.media_rx.try_recv() {
            self.pacer.on_media(packet, now);
        }
        tracing::info!(queued = self.pacer.queue().len(), "sender shutting down");
        Instant::now() + self.grace
    }

    /// [`Self::drain`], cut off at the grace deadline once shutdown has
    /// begun. Returns false when the deadline passed first.
    async fn drain_until(&mut self, deadline: Option<Instant>) -> Result<bool, SessionError> {
        let Some(deadline) = deadline else {
            return self.drain().await.map(|()| true);
        };
        match tokio::time::timeout_at(deadline, self.drain()).await {
            Ok(result) => result.map(|()| true),
            Err(_) => {
                tracing::debug!(
                    remaining = self.pacer.queue().len(),
                    "shutdown grace period elapsed mid-drain"
                );
                Ok(false)
            }
        }
    }

    /// Greedy drain: write while admitted and the queue is non-empty.
    async fn drain(&mut self) -> Result<(), SessionError> {
        loop {
            match self.pacer.poll_transmit(self.clock.now()) {
                PollTransmit::Transmit(item) => {
                    let seq = item.packet.seq;
                    match self.writer.write(item.packet.to_bytes()).await {
                        Ok(n) => {
                            self.stats.packets_written += 1;
                            self.stats.bytes_written += n as u64;
                            tracing::trace!(seq, bytes = n, "packet written");
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            self.stats.write_errors += 1;
                            tracing::warn!(seq, error = %e, "session write failed, packet dropped");
                            continue;
                        }
                    }
                    let now = self.clock.now();
                    if let Some(inference) = &mut self.inference {
                        inference.on_transmitted(seq, item.size(), now);
                    }
                    if let Some(wait) = self.pacer.on_transmitted(&item, now) {
                        self.arm(wait);
                        return Ok(());
                    }
                }
                PollTransmit::Wait(wait) => {
                    self.arm(wait);
                    return Ok(());
                }
                PollTransmit::Blocked | PollTransmit::Empty => return Ok(()),
            }
        }
    }

    fn arm(&mut self, wait: Duration) {
        tracing::trace!(wait_us = wait.as_micros() as u64, "pacing timer armed");
        self.pacing_deadline = Some(Instant::now() + wait);
    }

    /// Turn a feedback message into engine input. Returns true when a drain
    /// attempt is due.
    fn on_feedback(&mut self, feedback: Bytes) -> bool {
        let now = self.clock.now();
        let report = match (&self.mode, &mut self.inference) {
            (FeedbackMode::Infer(_), Some(inference)) => {
                let minimal = match MinimalFeedback::decode(&feedback) {
                    Ok(m) => m,
                    Err(e) => {
                        self.stats.feedback_discarded += 1;
                        tracing::debug!(error = %e, "malformed minimal feedback discarded");
                        return false;
                    }
                };
                match inference.on_minimal_feedback(minimal, now) {
                    Some(report) => report,
                    None => return false,
                }
            }
            _ => {
                if let Err(e) = CcFeedbackReport::decode(&feedback) {
                    self.stats.feedback_discarded += 1;
                    tracing::debug!(error = %e, "malformed feedback report discarded");
                    return false;
                }
                feedback
            }
        };
        self.stats.feedback_applied += 1;
        self.pacer.on_feedback(&report, now)
    }

    fn on_ack_batch(&mut self, batch: &[AckedPacket]) {
        self.stats.ack_batches += 1;
        if let Some(inference) = &mut self.inference {
            inference.on_ack_batch(batch);
        }
    }

    fn answer(&mut self, query: EngineQuery) {
        let ssrc = self.pacer.ssrc();
        let now = self.clock.now();
        let snapshot = EngineSnapshot {
            target_bps: self.pacer.engine().target_bitrate(ssrc),
            queue_len: self.pacer.queue().len(),
            statistics: query
                .with_statistics
                .then(|| self.pacer.engine().statistics_snapshot(now)),
        };
        // The asker may have given up.
        let _ = query.reply.send(snapshot);
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
