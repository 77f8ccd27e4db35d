//! # Bitrate Feedback Loop
//!
//! Polls the engine's target bitrate on a fixed tick and pushes changes to
//! the media source. A non-positive target means the stream is starved:
//! the source is asked for a key frame instead of being throttled to zero.
//! Each tick also writes one statistics line to the diagnostic sink.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::clock::NtpClock;
use crate::media::RateControl;
use crate::sender::EngineQueries;
use crate::shutdown::ShutdownSignal;

/// Default poll interval.
pub const DEFAULT_TICK: Duration = Duration::from_millis(20);

// ─── Controller ──────────────────────────────────────────────────────────────

/// What one tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitrateAction {
    SetBitrate(u64),
    RequestKeyFrame,
    Unchanged,
}

/// Change detection between ticks. Rates are compared in whole kbit/s.
#[derive(Debug, Clone, Default)]
pub struct BitrateController {
    last_kbps: Option<u64>,
    request_key_frames: bool,
}

impl BitrateController {
    pub fn new(request_key_frames: bool) -> Self {
        BitrateController {
            last_kbps: None,
            request_key_frames,
        }
    }

    pub fn last_kbps(&self) -> Option<u64> {
        self.last_kbps
    }

    pub fn on_tick(&mut self, target_bps: f64) -> BitrateAction {
        let kbps = (target_bps / 1000.0) as i64;
        if kbps <= 0 {
            return if self.request_key_frames {
                BitrateAction::RequestKeyFrame
            } else {
                BitrateAction::Unchanged
            };
        }
        let kbps = kbps as u64;
        if self.last_kbps == Some(kbps) {
            return BitrateAction::Unchanged;
        }
        self.last_kbps = Some(kbps);
        BitrateAction::SetBitrate(kbps * 1000)
    }
}

// ─── Stats sink ──────────────────────────────────────────────────────────────

/// Destination of the per-tick statistics line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StatsSink {
    Stdout,
    File(PathBuf),
    #[default]
    Disabled,
}

impl StatsSink {
    pub fn open(&self) -> io::Result<Option<Box<dyn Write + Send>>> {
        Ok(match self {
            StatsSink::Stdout => Some(Box::new(io::stdout())),
            StatsSink::File(path) => Some(Box::new(BufWriter::new(File::create(path)?))),
            StatsSink::Disabled => None,
        })
    }
}

impl FromStr for StatsSink {
    type Err = std::convert::Infallible;

    /// `stdout`, `off` / `none` / empty, or a file path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "stdout" | "-" => StatsSink::Stdout,
            "" | "off" | "none" | "disabled" => StatsSink::Disabled,
            path => StatsSink::File(PathBuf::from(path)),
        })
    }
}

// ─── Loop ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BitrateConfig {
    pub tick: Duration,
    pub request_key_frames: bool,
    pub stats_sink: StatsSink,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        BitrateConfig {
            tick: DEFAULT_TICK,
            request_key_frames: true,
            stats_sink: StatsSink::Disabled,
        }
    }
}

/// Run the loop until shutdown or until the sender task ends. Returns the
/// last applied rate in bit/s.
pub async fn run_bitrate_loop<R: RateControl>(
    config: BitrateConfig,
    queries: EngineQueries,
    mut source: R,
    mut sink: Option<Box<dyn Write + Send>>,
    clock: NtpClock,
    mut shutdown: ShutdownSignal,
) -> Option<u64> {
    let mut controller = BitrateController::new(config.request_key_frames);
    let mut ticker = tokio::time::interval(config.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {}
        }
        let Some(snapshot) = queries.snapshot(sink.is_some()).await else {
            tracing::debug!("sender gone, bitrate loop stopping");
            break;
        };

        match controller.on_tick(snapshot.target_bps) {
            BitrateAction::SetBitrate(bps) => {
                tracing::info!(bitrate_bps = bps, "target bitrate changed");
                source.set_target_bitrate(bps);
            }
            BitrateAction::RequestKeyFrame => {
                tracing::debug!("target bitrate starved, requesting key frame");
                source.request_key_frame();
            }
            BitrateAction::Unchanged => {}
        }

        if let (Some(out), Some(stats)) = (sink.as_mut(), snapshot.statistics.as_deref()) {
            let line = format!(
                "{} {} {}",
                clock.elapsed().as_millis(),
                snapshot.queue_len,
                stats
            );
            if let Err(e) = writeln!(out, "{line}") {
                tracing::warn!(error = %e, "stats sink write failed, disabling");
                sink = None;
            }
        }
    }

    if let Some(out) = sink.as_mut() {
        out.flush().ok();
    }
    controller.last_kbps().map(|kbps| kbps * 1000)
}
