//! # Integration tests: paced sender ↔ receiver
//!
//! The pacer tests drive the state machine directly with stub engines. The
//! session tests run the async sender and receiver over loopback UDP and
//! QUIC.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use shoal_transport::bitrate::{run_bitrate_loop, BitrateConfig, StatsSink};
use shoal_transport::clock::NtpClock;
use shoal_transport::engine::{Admission, CongestionEngine, PassThroughEngine};
use shoal_transport::error::SessionError;
use shoal_transport::feedback::{CcFeedbackReport, FeedbackBuilder};
use shoal_transport::media::{MediaPacket, MediaSink, RateControl, RTP_HEADER_SIZE};
use shoal_transport::pacer::{Pacer, PacerConfig, PollTransmit};
use shoal_transport::queue::QueueStatus;
use shoal_transport::quic::QuicServer;
use shoal_transport::receiver::{run_receiver, ReceiverConfig};
use shoal_transport::sender::{PacedSender, SenderConfig};
use shoal_transport::session::{
    self, datagram, read_length_prefixed, stream, PacketWriter, SessionKind, UdpListener,
};
use shoal_transport::shutdown::shutdown_channel;
use tokio::sync::mpsc;

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Engine whose admission is toggled from outside.
#[derive(Clone)]
struct GateEngine {
    open: Arc<AtomicBool>,
    transmitted: Arc<Mutex<Vec<(u16, usize)>>>,
}

impl GateEngine {
    fn new(open: bool) -> Self {
        GateEngine {
            open: Arc::new(AtomicBool::new(open)),
            transmitted: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl CongestionEngine for GateEngine {
    fn register_stream(&mut self, _ssrc: u32, _min: f64, _max: f64, _initial: f64) {}

    fn admit_media_frame(&mut self, _now: u32, _ssrc: u32, _size: usize) {}

    fn is_ok_to_transmit(&mut self, _now: u32, _ssrc: u32, _queue: &dyn QueueStatus) -> Admission {
        if self.open.load(Ordering::SeqCst) {
            Admission::Now
        } else {
            Admission::Blocked
        }
    }

    fn record_transmitted(&mut self, _now: u32, _ssrc: u32, size: usize, seq: u16, _marker: bool) -> Admission {
        self.transmitted.lock().unwrap().push((seq, size));
        Admission::Now
    }

    fn apply_feedback(&mut self, _now: u32, _report: &[u8]) {}

    fn target_bitrate(&self, _ssrc: u32) -> f64 {
        1_000_000.0
    }

    fn statistics_snapshot(&self, _now: u32) -> String {
        String::new()
    }
}

fn packet(seq: u16, wire_len: usize) -> MediaPacket {
    MediaPacket::new(1, seq, seq as u32 * 3000, Bytes::from(vec![0xAB; wire_len - RTP_HEADER_SIZE]))
}

/// Drain the pacer to completion, returning what it handed out.
fn drain<E: CongestionEngine>(pacer: &mut Pacer<E>) -> Vec<MediaPacket> {
    let mut out = Vec::new();
    loop {
        match pacer.poll_transmit(0) {
            PollTransmit::Transmit(item) => {
                pacer.on_transmitted(&item, 0);
                out.push(item.packet);
            }
            _ => return out,
        }
    }
}

#[derive(Clone, Default)]
struct CollectingSink(Arc<Mutex<Vec<u16>>>);

impl MediaSink for CollectingSink {
    fn consume(&mut self, packet: MediaPacket) {
        self.0.lock().unwrap().push(packet.seq);
    }
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

// ─── Pacer ──────────────────────────────────────────────────────────────────

#[test]
fn always_admitting_engine_sends_each_packet_once_in_order() {
    let mut pacer = Pacer::new(PacerConfig::default(), GateEngine::new(true));
    let mut sent = Vec::new();
    for seq in 0..50u16 {
        if pacer.on_media(packet(seq, 200), 0) {
            sent.extend(drain(&mut pacer).into_iter().map(|p| p.seq));
        }
    }
    sent.extend(drain(&mut pacer).into_iter().map(|p| p.seq));
    assert_eq!(sent, (0..50).collect::<Vec<_>>());
    assert!(pacer.queue().is_empty());
}

#[test]
fn blocked_engine_holds_packets_until_admission_opens() {
    let engine = GateEngine::new(false);
    let gate = engine.open.clone();
    let mut pacer = Pacer::new(PacerConfig::default(), engine);

    for seq in 0..5u16 {
        pacer.on_media(packet(seq, 100), 0);
        assert!(drain(&mut pacer).is_empty());
    }
    assert_eq!(pacer.queue().len(), 5);

    gate.store(true, Ordering::SeqCst);
    assert!(pacer.on_feedback(&[], 0));
    let sent: Vec<u16> = drain(&mut pacer).into_iter().map(|p| p.seq).collect();
    assert_eq!(sent, vec![0, 1, 2, 3, 4]);
}

#[test]
fn engine_sees_wire_sizes_in_order_and_queue_empties() {
    let engine = GateEngine::new(true);
    let transmitted = engine.transmitted.clone();
    let mut pacer = Pacer::new(PacerConfig::default(), engine);
    for (seq, size) in [(10u16, 100usize), (11, 200), (12, 150)] {
        pacer.on_media(packet(seq, size), 0);
    }
    assert_eq!(pacer.queue().total_bytes(), 450);

    let sent = drain(&mut pacer);
    assert_eq!(sent.iter().map(MediaPacket::wire_len).collect::<Vec<_>>(), vec![100, 200, 150]);
    assert_eq!(*transmitted.lock().unwrap(), vec![(10, 100), (11, 200), (12, 150)]);
    assert_eq!(pacer.queue().total_bytes(), 0);
}

// ─── Framing ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn length_prefixed_frame_is_delivered_once() {
    let wire: &[u8] = &[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'];
    let mut reader = wire;
    let (tx, mut rx) = mpsc::channel(4);
    let frames = read_length_prefixed(&mut reader, &tx, 1024).await.unwrap();
    drop(tx);
    assert_eq!(frames, 1);
    assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
    assert!(rx.recv().await.is_none());
}

// ─── Sessions ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn udp_session_delivers_media_and_ends_stream() {
    let mut listener = UdpListener::bind(loopback()).await.unwrap();
    let client = session::connect(SessionKind::Udp, listener.local_addr()).await.unwrap();
    let server = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.kind, SessionKind::Udp);

    let clock = NtpClock::new();
    let (_trigger, signal) = shutdown_channel();
    let sink = CollectingSink::default();
    let receiver = tokio::spawn(run_receiver(
        client,
        ReceiverConfig::default(),
        sink.clone(),
        clock,
        signal.clone(),
    ));

    let session::Session { writer, feedback, .. } = server;
    let (sender, handle) = PacedSender::new(
        SenderConfig::default(),
        PassThroughEngine::new(1_000_000.0),
        writer,
        clock,
        None,
        signal,
    );
    let sender = tokio::spawn(sender.run());
    for seq in 0..5u16 {
        handle.media.send(packet(seq, 300)).await.unwrap();
    }
    drop(handle);

    let sender_stats = tokio::time::timeout(Duration::from_secs(5), sender).await.unwrap().unwrap();
    assert_eq!(sender_stats.packets_written, 5);
    assert_eq!(sender_stats.bytes_written, 1500);

    let receiver_stats = tokio::time::timeout(Duration::from_secs(5), receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(receiver_stats.packets_received, 5);
    assert_eq!(*sink.0.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    drop(feedback);
}

#[tokio::test]
async fn quic_datagram_session_delivers_media_and_feedback() {
    let clock = NtpClock::new();
    let server = QuicServer::bind(loopback(), clock).unwrap();
    let addr = server.local_addr().unwrap();

    let (accepted, client) = tokio::join!(server.accept(), session::connect(SessionKind::QuicDatagram, addr));
    let accepted = accepted.unwrap().unwrap();
    let mut client = client.unwrap();
    let server_session = datagram::session(accepted);
    assert!(server_session.acks.is_some());

    let (trigger, signal) = shutdown_channel();
    let session::Session { writer, feedback, acks, .. } = server_session;
    let (sender, handle) = PacedSender::new(
        SenderConfig::default(),
        PassThroughEngine::new(1_000_000.0),
        writer,
        clock,
        acks,
        signal.clone(),
    );
    let sender = tokio::spawn(sender.run());

    // Feedback from the client reaches the sender's feedback channel.
    let (fb_tx, mut fb_rx) = mpsc::channel(16);
    let reader = tokio::spawn(feedback.run(fb_tx, signal));

    for seq in 0..5u16 {
        handle.media.send(packet(seq, 400)).await.unwrap();
    }
    let mut received = Vec::new();
    let mut builder = FeedbackBuilder::new(2);
    while received.len() < 5 {
        let datagram = tokio::time::timeout(Duration::from_secs(5), client.ingress.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let pkt = MediaPacket::decode(&datagram).unwrap();
        builder.record(pkt.ssrc, pkt.seq, clock.now(), 0);
        received.push(pkt.seq);
    }
    assert_eq!(received, vec![0, 1, 2, 3, 4]);

    let report = builder.build(clock.now()).unwrap();
    client.feedback.send(report.to_bytes().unwrap()).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), fb_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(CcFeedbackReport::decode(&echoed).unwrap(), report);

    trigger.trigger();
    let stats = tokio::time::timeout(Duration::from_secs(5), sender).await.unwrap().unwrap();
    assert_eq!(stats.packets_written, 5);
    assert!(tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .unwrap()
        .unwrap()
        .is_ok());

    // The sender ended the stream; the client sees a clean end.
    let end = tokio::time::timeout(Duration::from_secs(5), client.ingress.next())
        .await
        .unwrap();
    assert!(matches!(end, Ok(None)));
    client.closer.close();
    server.close();
}

// ─── Bitrate loop ───────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct RecordingEncoder(Arc<Mutex<Vec<u64>>>);

impl RateControl for RecordingEncoder {
    fn set_target_bitrate(&mut self, bps: u64) {
        self.0.lock().unwrap().push(bps);
    }
}

struct NullWriter;

impl session::PacketWriter for NullWriter {
    async fn write(&mut self, packet: Bytes) -> Result<usize, SessionError> {
        Ok(packet.len())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

#[tokio::test]
async fn bitrate_loop_forwards_engine_target_to_encoder() {
    let clock = NtpClock::new();
    let (trigger, signal) = shutdown_channel();
    let mut config = SenderConfig::default();
    config.pacer.initial_rate_bps = 3_000_000.0;
    let (sender, handle) = PacedSender::new(
        config,
        PassThroughEngine::new(0.0),
        NullWriter,
        clock,
        None,
        signal.clone(),
    );
    let sender = tokio::spawn(sender.run());

    let encoder = RecordingEncoder::default();
    let bitrate = tokio::spawn(run_bitrate_loop(
        BitrateConfig {
            tick: Duration::from_millis(5),
            request_key_frames: true,
            stats_sink: StatsSink::Disabled,
        },
        handle.queries.clone(),
        encoder.clone(),
        None,
        clock,
        signal,
    ));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while encoder.0.lock().unwrap().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    trigger.trigger();
    let last = tokio::time::timeout(Duration::from_secs(5), bitrate).await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(5), sender).await.unwrap().unwrap();

    // Applied once; the unchanged target is not re-applied.
    assert_eq!(*encoder.0.lock().unwrap(), vec![3_000_000]);
    assert_eq!(last, Some(3_000_000));
}

#[tokio::test]
async fn quic_stream_per_frame_session_delivers_media_and_feedback() {
    let clock = NtpClock::new();
    let server = QuicServer::bind(loopback(), clock).unwrap();
    let addr = server.local_addr().unwrap();

    let (accepted, client) = tokio::join!(
        server.accept(),
        session::connect(SessionKind::QuicStreamPerFrame, addr)
    );
    let server_session = stream::session(accepted.unwrap().unwrap());
    let mut client = client.unwrap();
    assert_eq!(server_session.kind, SessionKind::QuicStreamPerFrame);
    assert_eq!(client.kind, SessionKind::QuicStreamPerFrame);

    let (trigger, signal) = shutdown_channel();
    let session::Session { writer, feedback, acks, .. } = server_session;
    let (sender, handle) = PacedSender::new(
        SenderConfig::default(),
        PassThroughEngine::new(1_000_000.0),
        writer,
        clock,
        acks,
        signal.clone(),
    );
    let sender = tokio::spawn(sender.run());
    let (fb_tx, mut fb_rx) = mpsc::channel(16);
    let reader = tokio::spawn(feedback.run(fb_tx, signal));

    // Sizes straddle a typical MTU so some streams span several packets.
    let sizes = [200usize, 1_500, 3_000, 64, 9_000];
    for (seq, &size) in sizes.iter().enumerate() {
        handle.media.send(packet(seq as u16, size)).await.unwrap();
    }
    let mut received = Vec::new();
    let mut builder = FeedbackBuilder::new(2);
    while received.len() < sizes.len() {
        let bytes = tokio::time::timeout(Duration::from_secs(5), client.ingress.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let pkt = MediaPacket::decode(&bytes).unwrap();
        builder.record(pkt.ssrc, pkt.seq, clock.now(), 0);
        received.push((pkt.seq, bytes.len()));
    }
    received.sort_unstable();
    let expected: Vec<(u16, usize)> = sizes.iter().enumerate().map(|(i, &s)| (i as u16, s)).collect();
    assert_eq!(received, expected);

    // Two framed reports back to back on one stream arrive as two messages.
    let first = builder.build(clock.now()).unwrap();
    builder.record(first.blocks[0].ssrc, 9, clock.now(), 0);
    let second = builder.build(clock.now()).unwrap();
    client.feedback.send(first.to_bytes().unwrap()).await.unwrap();
    client.feedback.send(second.to_bytes().unwrap()).await.unwrap();
    for expected in [&first, &second] {
        let echoed = tokio::time::timeout(Duration::from_secs(5), fb_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&CcFeedbackReport::decode(&echoed).unwrap(), expected);
    }

    trigger.trigger();
    let stats = tokio::time::timeout(Duration::from_secs(5), sender).await.unwrap().unwrap();
    assert_eq!(stats.packets_written, sizes.len() as u64);
    assert!(tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .unwrap()
        .unwrap()
        .is_ok());

    let end = tokio::time::timeout(Duration::from_secs(5), client.ingress.next())
        .await
        .unwrap();
    assert!(matches!(end, Ok(None)));
    client.closer.close();
    server.close();
}

#[tokio::test]
async fn oversized_datagram_is_not_tracked_for_acks() {
    let server = QuicServer::bind(loopback(), NtpClock::new()).unwrap();
    let addr = server.local_addr().unwrap();
    let (accepted, client) = tokio::join!(server.accept(), session::connect(SessionKind::QuicDatagram, addr));
    let accepted = accepted.unwrap().unwrap();
    let client = client.unwrap();
    let probe = accepted.probe.clone();
    let mut writer = datagram::session(accepted).writer;

    let err = writer.write(packet(1, 70_000).to_bytes()).await.unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(probe.pending_len(), 0);

    writer.write(packet(2, 400).to_bytes()).await.unwrap();
    client.closer.close();
    server.close();
}
