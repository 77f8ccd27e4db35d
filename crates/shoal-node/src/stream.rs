//! `shoal stream`: dial a server and receive its media, reporting feedback.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Context;
use shoal_transport::clock::NtpClock;
use shoal_transport::media::{MediaPacket, MediaSink};
use shoal_transport::receiver::run_receiver;
use shoal_transport::session;
use shoal_transport::shutdown::ShutdownSignal;

use crate::config::NodeConfig;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Counts what arrives and logs a summary every few seconds.
#[derive(Debug)]
pub struct CountingSink {
    packets: u64,
    bytes: u64,
    frames: u64,
    window_bytes: u64,
    window_start: Instant,
    interval: Duration,
}

impl CountingSink {
    pub fn new(interval: Duration) -> Self {
        CountingSink {
            packets: 0,
            bytes: 0,
            frames: 0,
            window_bytes: 0,
            window_start: Instant::now(),
            interval,
        }
    }
}

impl MediaSink for CountingSink {
    fn consume(&mut self, packet: MediaPacket) {
        let len = packet.wire_len() as u64;
        self.packets += 1;
        self.bytes += len;
        self.window_bytes += len;
        if packet.marker {
            self.frames += 1;
        }

        let elapsed = self.window_start.elapsed();
        if elapsed >= self.interval {
            tracing::info!(
                packets = self.packets,
                bytes = self.bytes,
                frames = self.frames,
                rate_kbps = (self.window_bytes as f64 * 8.0 / elapsed.as_secs_f64() / 1000.0) as u64,
                "media received"
            );
            self.window_bytes = 0;
            self.window_start = Instant::now();
        }
    }
}

pub async fn run(config: NodeConfig, addr: SocketAddr, shutdown: ShutdownSignal) -> anyhow::Result<()> {
    let kind = config.transport.session.kind;
    let client = session::connect(kind, addr)
        .await
        .with_context(|| format!("failed to connect to {addr} over {kind}"))?;
    tracing::info!(server = %addr, %kind, "connected");

    let stats = run_receiver(
        client,
        config.transport.receiver.clone(),
        CountingSink::new(STATS_INTERVAL),
        NtpClock::new(),
        shutdown,
    )
    .await
    .context("receive session failed")?;

    tracing::info!(
        stats = %serde_json::to_string(&stats).context("failed to encode stats")?,
        "stream finished"
    );
    Ok(())
}
