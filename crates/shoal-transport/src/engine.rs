//! # Congestion Engine contract
//!
//! The congestion-control algorithm is an external collaborator. The core
//! never inspects its state; it only sequences the calls below from the
//! sender task:
//!
//! ```text
//!  media arrives ──► admit_media_frame
//!  drain step   ──► is_ok_to_transmit ──► Now ──► write ──► record_transmitted
//!                                      ├─► Wait(d) ─► arm timer
//!                                      └─► Blocked ─► wait for next event
//!  feedback     ──► apply_feedback
//!  bitrate tick ──► target_bitrate / statistics_snapshot
//! ```
//!
//! All times are Q16.16 NTP units from [`crate::clock::NtpClock`].

use std::time::Duration;

use crate::queue::QueueStatus;

/// Admission decision for the next packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// Send immediately.
    Now,
    /// Retry after the given delay.
    Wait(Duration),
    /// Congestion window full; do not retry until new feedback or media
    /// changes the engine's state.
    Blocked,
}

impl Admission {
    /// Map an engine's wait-seconds result: negative means blocked, zero
    /// means send now.
    pub fn from_secs_f64(wait: f64) -> Self {
        if wait.is_nan() || wait < 0.0 {
            Admission::Blocked
        } else if wait == 0.0 {
            Admission::Now
        } else {
            Admission::Wait(Duration::from_secs_f64(wait.min(3600.0)))
        }
    }

    /// Collapse waits shorter than `epsilon` to [`Admission::Now`].
    pub fn with_epsilon(self, epsilon: Duration) -> Self {
        match self {
            Admission::Wait(d) if d <= epsilon => Admission::Now,
            other => other,
        }
    }
}

/// Operations the core requires from a congestion-control engine.
pub trait CongestionEngine: Send {
    /// Register a media stream with its rate floor and ceiling (bits/s) and
    /// the starting target rate.
    fn register_stream(&mut self, ssrc: u32, min_rate_bps: f64, max_rate_bps: f64, initial_rate_bps: f64);

    /// A new frame (or frame fragment) of `size` bytes entered the queue.
    fn admit_media_frame(&mut self, now: u32, ssrc: u32, size: usize);

    /// May the head of `queue` be transmitted now?
    fn is_ok_to_transmit(&mut self, now: u32, ssrc: u32, queue: &dyn QueueStatus) -> Admission;

    /// A packet was written to the session. The result paces the next one.
    fn record_transmitted(
        &mut self,
        now: u32,
        ssrc: u32,
        size: usize,
        seq: u16,
        marker: bool,
    ) -> Admission;

    /// Ingest a raw CC feedback report.
    fn apply_feedback(&mut self, now: u32, report: &[u8]);

    /// Current target bitrate for the stream in bits/s. Zero or negative
    /// signals rate starvation.
    fn target_bitrate(&self, ssrc: u32) -> f64;

    /// Implementation-defined diagnostic line.
    fn statistics_snapshot(&self, now: u32) -> String;
}

impl<E: CongestionEngine + ?Sized> CongestionEngine for Box<E> {
    fn register_stream(&mut self, ssrc: u32, min_rate_bps: f64, max_rate_bps: f64, initial_rate_bps: f64) {
        (**self).register_stream(ssrc, min_rate_bps, max_rate_bps, initial_rate_bps)
    }

    fn admit_media_frame(&mut self, now: u32, ssrc: u32, size: usize) {
        (**self).admit_media_frame(now, ssrc, size)
    }

    fn is_ok_to_transmit(&mut self, now: u32, ssrc: u32, queue: &dyn QueueStatus) -> Admission {
        (**self).is_ok_to_transmit(now, ssrc, queue)
    }

    fn record_transmitted(
        &mut self,
        now: u32,
        ssrc: u32,
        size: usize,
        seq: u16,
        marker: bool,
    ) -> Admission {
        (**self).record_transmitted(now, ssrc, size, seq, marker)
    }

    fn apply_feedback(&mut self, now: u32, report: &[u8]) {
        (**self).apply_feedback(now, report)
    }

    fn target_bitrate(&self, ssrc: u32) -> f64 {
        (**self).target_bitrate(ssrc)
    }

    fn statistics_snapshot(&self, now: u32) -> String {
        (**self).statistics_snapshot(now)
    }
}

// ─── Pass-through engine ─────────────────────────────────────────────────────

/// Engine that admits every packet immediately and reports a constant
/// target bitrate. Used when no congestion controller is plugged in.
#[derive(Debug, Clone)]
pub struct PassThroughEngine {
    rate_bps: f64,
    frames: u64,
    transmitted: u64,
    feedback_reports: u64,
}

impl PassThroughEngine {
    pub fn new(rate_bps: f64) -> Self {
        PassThroughEngine {
            rate_bps,
            frames: 0,
            transmitted: 0,
            feedback_reports: 0,
        }
    }
}

impl CongestionEngine for PassThroughEngine {
    fn register_stream(&mut self, _ssrc: u32, min_rate_bps: f64, max_rate_bps: f64, initial_rate_bps: f64) {
        self.rate_bps = initial_rate_bps.clamp(min_rate_bps, max_rate_bps.max(min_rate_bps));
    }

    fn admit_media_frame(&mut self, _now: u32, _ssrc: u32, _size: usize) {
        self.frames += 1;
    }

    fn is_ok_to_transmit(&mut self, _now: u32, _ssrc: u32, _queue: &dyn QueueStatus) -> Admission {
        Admission::Now
    }

    fn record_transmitted(
        &mut self,
        _now: u32,
        _ssrc: u32,
        _size: usize,
        _seq: u16,
        _marker: bool,
    ) -> Admission {
        self.transmitted += 1;
        Admission::Now
    }

    fn apply_feedback(&mut self, _now: u32, _report: &[u8]) {
        self.feedback_reports += 1;
    }

    fn target_bitrate(&self, _ssrc: u32) -> f64 {
        self.rate_bps
    }

    fn statistics_snapshot(&self, _now: u32) -> String {
        format!(
            "frames={} transmitted={} feedback={} target_bps={:.0}",
            self.frames, self.transmitted, self.feedback_reports, self.rate_bps
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::PacketQueue;

    #[test]
    fn wait_seconds_mapping() {
        assert_eq!(Admission::from_secs_f64(-1.0), Admission::Blocked);
        assert_eq!(Admission::from_secs_f64(f64::NAN), Admission::Blocked);
        assert_eq!(Admission::from_secs_f64(0.0), Admission::Now);
        assert_eq!(
            Admission::from_secs_f64(0.25),
            Admission::Wait(Duration::from_millis(250))
        );
    }

    #[test]
    fn epsilon_collapses_short_waits() {
        let eps = Duration::from_millis(1);
        assert_eq!(
            Admission::Wait(Duration::from_micros(500)).with_epsilon(eps),
            Admission::Now
        );
        assert_eq!(
            Admission::Wait(Duration::from_millis(5)).with_epsilon(eps),
            Admission::Wait(Duration::from_millis(5))
        );
        assert_eq!(Admission::Blocked.with_epsilon(eps), Admission::Blocked);
    }

    #[test]
    fn pass_through_always_admits() {
        let mut engine = PassThroughEngine::new(0.0);
        engine.register_stream(1, 100_000.0, 2_000_000.0, 50_000.0);
        assert_eq!(engine.target_bitrate(1), 100_000.0);
        let q = PacketQueue::new();
        assert_eq!(engine.is_ok_to_transmit(0, 1, &q), Admission::Now);
        assert_eq!(engine.record_transmitted(0, 1, 100, 0, false), Admission::Now);
        assert!(engine.statistics_snapshot(0).contains("transmitted=1"));
    }

    #[test]
    fn boxed_engine_delegates() {
        let mut engine: Box<dyn CongestionEngine> = Box::new(PassThroughEngine::new(1e6));
        engine.apply_feedback(0, &[]);
        assert!(engine.statistics_snapshot(0).contains("feedback=1"));
    }
}
