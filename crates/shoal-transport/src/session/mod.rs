//! # Transport Sessions
//!
//! Three wire-level delivery strategies behind one contract:
//!
//! | kind                    | media egress                 | feedback ingress                   |
//! |-------------------------|------------------------------|------------------------------------|
//! | `quic-datagram`         | one unreliable datagram      | datagrams in the reverse direction |
//! | `quic-stream-per-frame` | one uni stream per packet    | one uni stream, length-prefixed    |
//! | `udp`                   | one UDP datagram             | any datagram from the peer         |
//!
//! A [`Session`] is split on creation: the [`SessionWriter`] is owned by the
//! sender task and the [`FeedbackReader`] by its own reader task, so no
//! component reads and writes the same primitive.
//!
//! The client (media receiving) side of each variant lives in the same
//! module as the server side: [`MediaIngress`] yields media packets and
//! [`FeedbackEgress`] sends feedback back.

pub mod datagram;
pub mod stream;
pub mod udp;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::correlator::AckedPacket;
use crate::error::{ConfigError, SessionError};
use crate::shutdown::ShutdownSignal;

pub use datagram::{DatagramFeedback, DatagramFeedbackSender, DatagramIngress, DatagramWriter};
pub use stream::{frame, read_length_prefixed, StreamFeedback, StreamFeedbackSender, StreamIngress, StreamWriter};
pub use udp::{UdpFeedback, UdpFeedbackSender, UdpIngress, UdpListener, UdpWriter};

// ─── Close codes ─────────────────────────────────────────────────────────────

/// QUIC application close codes.
pub mod close_code {
    /// Orderly close without a reason.
    pub const NORMAL: u32 = 0;
    /// Sender finished the stream. Clean.
    pub const END_OF_STREAM: u32 = 1;
    /// Session failed.
    pub const ERROR: u32 = 2;
}

/// Reason phrase and UDP control datagram for the end-of-stream close.
pub const EOS_REASON: &[u8] = b"eos";

/// Greeting sent by a dialing client.
pub const HELLO: &[u8] = b"hello";

/// Largest feedback message accepted on any session.
pub const MAX_FEEDBACK_LEN: usize = 64 * 1024;

/// True when a QUIC connection error represents a clean termination.
pub fn is_clean_close(e: &quinn::ConnectionError) -> bool {
    match e {
        quinn::ConnectionError::LocallyClosed => true,
        quinn::ConnectionError::ApplicationClosed(close) => {
            let code = close.error_code.into_inner();
            code == close_code::NORMAL as u64 || code == close_code::END_OF_STREAM as u64
        }
        _ => false,
    }
}

pub(crate) fn close_with_error(conn: &quinn::Connection, reason: &dyn fmt::Display) {
    let reason = reason.to_string();
    conn.close(
        quinn::VarInt::from_u32(close_code::ERROR),
        reason.as_bytes(),
    );
}

pub(crate) fn close_end_of_stream(conn: &quinn::Connection) {
    conn.close(quinn::VarInt::from_u32(close_code::END_OF_STREAM), EOS_REASON);
}

// ─── Session kind ────────────────────────────────────────────────────────────

/// Which delivery strategy a session uses. Chosen once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
    Udp,
    #[default]
    QuicDatagram,
    QuicStreamPerFrame,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Udp => "udp",
            SessionKind::QuicDatagram => "quic-datagram",
            SessionKind::QuicStreamPerFrame => "quic-stream-per-frame",
        }
    }

    pub fn is_quic(&self) -> bool {
        !matches!(self, SessionKind::Udp)
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "udp" => Ok(SessionKind::Udp),
            "quic-datagram" | "datagram" => Ok(SessionKind::QuicDatagram),
            "quic-stream-per-frame" | "streamperframe" => Ok(SessionKind::QuicStreamPerFrame),
            other => Err(ConfigError::UnknownVariant {
                field: "session.kind",
                value: other.to_string(),
            }),
        }
    }
}

// ─── Egress contract ─────────────────────────────────────────────────────────

/// Media egress half of a session.
pub trait PacketWriter: Send {
    /// Send one encoded media packet. Returns the bytes written.
    fn write(&mut self, packet: Bytes) -> impl Future<Output = Result<usize, SessionError>> + Send;

    /// Tear the session down, signalling end of stream to the peer.
    fn close(&mut self) -> impl Future<Output = Result<(), SessionError>> + Send;
}

/// Writer for whichever variant the session uses.
#[derive(Debug)]
pub enum SessionWriter {
    Datagram(DatagramWriter),
    StreamPerFrame(StreamWriter),
    Udp(UdpWriter),
}

impl PacketWriter for SessionWriter {
    async fn write(&mut self, packet: Bytes) -> Result<usize, SessionError> {
        match self {
            SessionWriter::Datagram(w) => w.write(packet),
            SessionWriter::StreamPerFrame(w) => w.write(packet).await,
            SessionWriter::Udp(w) => w.write(packet).await,
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        match self {
            SessionWriter::Datagram(w) => {
                w.close();
                Ok(())
            }
            SessionWriter::StreamPerFrame(w) => {
                w.close();
                Ok(())
            }
            SessionWriter::Udp(w) => w.close().await,
        }
    }
}

// ─── Feedback ingress ────────────────────────────────────────────────────────

/// Feedback ingress half of a session.
#[derive(Debug)]
pub enum FeedbackReader {
    Datagram(DatagramFeedback),
    StreamPerFrame(StreamFeedback),
    Udp(UdpFeedback),
}

impl FeedbackReader {
    /// Forward every feedback message to `tx` until shutdown, a clean peer
    /// close, or a fatal error. Returns `Ok` for clean termination.
    pub async fn run(self, tx: mpsc::Sender<Bytes>, shutdown: ShutdownSignal) -> Result<(), SessionError> {
        let result = match self {
            FeedbackReader::Datagram(r) => r.run(tx, shutdown).await,
            FeedbackReader::StreamPerFrame(r) => r.run(tx, shutdown).await,
            FeedbackReader::Udp(r) => r.run(tx, shutdown).await,
        };
        match result {
            Err(e) if e.is_clean_close() => {
                tracing::debug!(reason = %e, "feedback reader finished");
                Ok(())
            }
            other => other,
        }
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// One accepted peer.
#[derive(Debug)]
pub struct Session {
    pub kind: SessionKind,
    pub peer: SocketAddr,
    pub writer: SessionWriter,
    pub feedback: FeedbackReader,
    /// QUIC acknowledgment batches, for inferred feedback.
    pub acks: Option<mpsc::Receiver<Vec<AckedPacket>>>,
}

// ─── Client side ─────────────────────────────────────────────────────────────

/// Media arriving at a dialing client.
#[derive(Debug)]
pub enum MediaIngress {
    Datagram(DatagramIngress),
    StreamPerFrame(StreamIngress),
    Udp(UdpIngress),
}

impl MediaIngress {
    /// Next media packet, or `None` once the sender ended the stream.
    pub async fn next(&mut self) -> Result<Option<Bytes>, SessionError> {
        let result = match self {
            MediaIngress::Datagram(i) => i.next().await,
            MediaIngress::StreamPerFrame(i) => i.next().await,
            MediaIngress::Udp(i) => i.next().await,
        };
        match result {
            Err(e) if e.is_clean_close() => Ok(None),
            other => other,
        }
    }
}

/// Feedback leaving a dialing client.
#[derive(Debug)]
pub enum FeedbackEgress {
    Datagram(DatagramFeedbackSender),
    StreamPerFrame(StreamFeedbackSender),
    Udp(UdpFeedbackSender),
}

impl FeedbackEgress {
    pub async fn send(&mut self, feedback: Bytes) -> Result<(), SessionError> {
        match self {
            FeedbackEgress::Datagram(s) => s.send(feedback),
            FeedbackEgress::StreamPerFrame(s) => s.send(feedback).await,
            FeedbackEgress::Udp(s) => s.send(feedback).await,
        }
    }
}

/// Client half of a dialed session.
#[derive(Debug)]
pub struct ClientSession {
    pub kind: SessionKind,
    pub ingress: MediaIngress,
    pub feedback: FeedbackEgress,
    pub closer: SessionCloser,
}

impl ClientSession {
    pub(crate) fn new(
        kind: SessionKind,
        ingress: MediaIngress,
        feedback: FeedbackEgress,
        quic: Option<(quinn::Endpoint, quinn::Connection)>,
    ) -> Self {
        ClientSession {
            kind,
            ingress,
            feedback,
            closer: SessionCloser { quic },
        }
    }
}

/// Keeps a dialed QUIC endpoint alive and closes it on request.
#[derive(Debug)]
pub struct SessionCloser {
    quic: Option<(quinn::Endpoint, quinn::Connection)>,
}

impl SessionCloser {
    pub fn close(&self) {
        if let Some((endpoint, conn)) = &self.quic {
            conn.close(quinn::VarInt::from_u32(close_code::NORMAL), b"");
            endpoint.close(quinn::VarInt::from_u32(close_code::NORMAL), b"");
        }
    }

    /// Wait up to `grace` for the close to reach the peer.
    pub async fn wait_idle(&self, grace: std::time::Duration) {
        if let Some((endpoint, _)) = &self.quic {
            tokio::time::timeout(grace, endpoint.wait_idle()).await.ok();
        }
    }
}

/// Dial `addr` with the given session kind.
pub async fn connect(kind: SessionKind, addr: SocketAddr) -> Result<ClientSession, SessionError> {
    match kind {
        SessionKind::Udp => udp::connect(addr).await,
        SessionKind::QuicDatagram => {
            let (endpoint, conn) = crate::quic::connect(addr).await?;
            Ok(datagram::client_session(endpoint, conn))
        }
        SessionKind::QuicStreamPerFrame => {
            let (endpoint, conn) = crate::quic::connect(addr).await?;
            stream::client_session(endpoint, conn).await
        }
    }
}
