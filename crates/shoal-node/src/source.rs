//! # Synthetic media source
//!
//! Stands in for an encoder. Every frame interval it emits one frame worth
//! of packets at the current target bitrate:
//!
//! ```text
//!   bitrate loop ──► SourceControl ──watch──┐
//!                                           ▼
//!   ticker ─────────────────────────► SyntheticSource ──► sender media channel
//! ```
//!
//! Key frames are three times the size of a regular frame. The last packet
//! of each frame carries the marker bit.

use bytes::Bytes;
use shoal_transport::media::{MediaPacket, RateControl, RTP_HEADER_SIZE};
use shoal_transport::shutdown::ShutdownSignal;
use tokio::sync::{mpsc, watch};

use crate::config::MediaConfig;

/// RTP clock rate of the synthetic stream.
const CLOCK_RATE: u32 = 90_000;

const KEY_FRAME_SCALE: u64 = 3;

// ─── Control ─────────────────────────────────────────────────────────────────

/// Encoder-side rate control handed to the bitrate loop.
#[derive(Debug)]
pub struct SourceControl {
    bitrate: watch::Sender<u64>,
    key_frames: mpsc::Sender<()>,
}

impl RateControl for SourceControl {
    fn set_target_bitrate(&mut self, bps: u64) {
        self.bitrate.send_replace(bps);
    }

    fn request_key_frame(&mut self) {
        // One outstanding request is enough.
        let _ = self.key_frames.try_send(());
    }
}

// ─── Frame layout ────────────────────────────────────────────────────────────

/// Payload sizes of the packets making up one frame.
pub fn frame_layout(bitrate_bps: u64, frame_rate: u32, packet_size: usize, key_frame: bool) -> Vec<usize> {
    let max_payload = packet_size.saturating_sub(RTP_HEADER_SIZE).max(1);
    let mut frame_bytes = (bitrate_bps / 8 / frame_rate.max(1) as u64).max(1);
    if key_frame {
        frame_bytes *= KEY_FRAME_SCALE;
    }
    let frame_bytes = usize::try_from(frame_bytes).unwrap_or(usize::MAX);

    let full = frame_bytes / max_payload;
    let rest = frame_bytes % max_payload;
    let mut sizes = vec![max_payload; full];
    if rest > 0 {
        sizes.push(rest);
    }
    sizes
}

// ─── Source ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SyntheticSource {
    config: MediaConfig,
    ssrc: u32,
    bitrate: watch::Receiver<u64>,
    key_frames: mpsc::Receiver<()>,
    seq: u16,
    timestamp: u32,
    filler: Bytes,
}

impl SyntheticSource {
    /// A source for stream `ssrc` starting at `initial_bps`.
    pub fn new(config: MediaConfig, ssrc: u32, initial_bps: u64) -> (SourceControl, Self) {
        let (bitrate_tx, bitrate) = watch::channel(initial_bps);
        let (key_tx, key_frames) = mpsc::channel(1);
        let source = SyntheticSource {
            config,
            ssrc,
            bitrate,
            key_frames,
            seq: rand::random(),
            timestamp: rand::random(),
            filler: Bytes::from(vec![0u8; config.packet_size.saturating_sub(RTP_HEADER_SIZE).max(1)]),
        };
        let control = SourceControl {
            bitrate: bitrate_tx,
            key_frames: key_tx,
        };
        (control, source)
    }

    /// Produce frames until shutdown or until the sender stops taking media.
    /// Returns the number of frames produced.
    pub async fn run(mut self, media: mpsc::Sender<MediaPacket>, mut shutdown: ShutdownSignal) -> u64 {
        let mut ticker = tokio::time::interval(self.config.frame_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let ts_step = CLOCK_RATE / self.config.frame_rate;
        let mut frames = 0u64;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            let bitrate = *self.bitrate.borrow();
            let key_frame = self.key_frames.try_recv().is_ok();
            let layout = frame_layout(bitrate, self.config.frame_rate, self.config.packet_size, key_frame);
            if key_frame {
                tracing::debug!(packets = layout.len(), "emitting key frame");
            }

            let last = layout.len().saturating_sub(1);
            for (i, size) in layout.into_iter().enumerate() {
                let mut packet = MediaPacket::new(self.ssrc, self.seq, self.timestamp, self.filler.slice(..size));
                if i == last {
                    packet = packet.with_marker();
                }
                self.seq = self.seq.wrapping_add(1);
                if media.send(packet).await.is_err() {
                    tracing::debug!(frames, "sender stopped taking media");
                    return frames;
                }
            }
            self.timestamp = self.timestamp.wrapping_add(ts_step);
            frames += 1;
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_transport::shutdown::shutdown_channel;

    #[test]
    fn layout_splits_frame_into_full_packets_and_remainder() {
        // 1 Mbit/s at 25 fps: 5000 bytes per frame.
        let sizes = frame_layout(1_000_000, 25, 1012, false);
        assert_eq!(sizes, vec![1000, 1000, 1000, 1000, 1000]);

        let sizes = frame_layout(1_000_000, 25, 1212, false);
        assert_eq!(sizes, vec![1200, 1200, 1200, 1200, 200]);
    }

    #[test]
    fn key_frames_are_larger() {
        let regular: usize = frame_layout(1_000_000, 25, 1100, false).iter().sum();
        let key: usize = frame_layout(1_000_000, 25, 1100, true).iter().sum();
        assert_eq!(key, regular * 3);
    }

    #[test]
    fn starved_bitrate_still_emits_one_packet() {
        assert_eq!(frame_layout(0, 30, 1100, false), vec![1]);
    }

    #[tokio::test]
    async fn frames_end_with_marker_and_follow_bitrate() {
        let config = MediaConfig {
            frame_rate: 100,
            packet_size: 112,
        };
        let (mut control, source) = SyntheticSource::new(config, 7, 80_000);
        let (tx, mut rx) = mpsc::channel(64);
        let (trigger, signal) = shutdown_channel();
        let task = tokio::spawn(source.run(tx, signal));

        // 80 kbit/s at 100 fps: 100 bytes, one packet.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.ssrc, 7);
        assert_eq!(first.payload.len(), 100);
        assert!(first.marker);

        control.set_target_bitrate(160_000);
        // After the change frames are two packets, only the second marked.
        let mut previous = first;
        let pair = loop {
            let next = rx.recv().await.unwrap();
            if !previous.marker && next.marker {
                break (previous, next);
            }
            previous = next;
        };
        trigger.trigger();
        task.await.unwrap();

        assert_eq!(pair.0.payload.len() + pair.1.payload.len(), 200);
        assert_eq!(pair.1.seq, pair.0.seq.wrapping_add(1));
        assert_eq!(pair.0.timestamp, pair.1.timestamp);
    }
}
