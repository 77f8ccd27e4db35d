//! # QUIC Stream-Per-Frame Session
//!
//! Media: the server opens a fresh unidirectional stream for every packet,
//! writes it whole and finishes the stream.
//!
//! Feedback: the client opens one unidirectional stream and writes framed
//! messages on it:
//!
//! ```text
//! ┌──────────────────┬─────────────────────┐
//! │ length (u32, BE) │ payload (length B)  │ ...
//! └──────────────────┴─────────────────────┘
//! ```
//!
//! The client also opens a bidirectional stream carrying a short greeting
//! when it connects.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use super::{
    close_end_of_stream, close_with_error, ClientSession, FeedbackEgress, FeedbackReader,
    MediaIngress, Session, SessionKind, SessionWriter, HELLO, MAX_FEEDBACK_LEN,
};
use crate::error::SessionError;
use crate::media::peek_sequence;
use crate::quic::{AckProbe, QuicConnection};
use crate::shutdown::ShutdownSignal;

/// Largest media packet accepted on one stream.
pub const MAX_MEDIA_LEN: usize = 1 << 20;

/// Length prefix size.
pub const FRAME_HEADER_LEN: usize = 4;

/// Build the server half of a stream-per-frame session.
pub fn session(accepted: QuicConnection) -> Session {
    let QuicConnection {
        connection,
        probe,
        acks,
    } = accepted;
    Session {
        kind: SessionKind::QuicStreamPerFrame,
        peer: connection.remote_address(),
        writer: SessionWriter::StreamPerFrame(StreamWriter {
            conn: connection.clone(),
            probe: Some(probe),
        }),
        feedback: FeedbackReader::StreamPerFrame(StreamFeedback { conn: connection }),
        acks: Some(acks),
    }
}

pub(crate) async fn client_session(
    endpoint: quinn::Endpoint,
    conn: quinn::Connection,
) -> Result<ClientSession, SessionError> {
    let (mut greeting, _recv) = conn.open_bi().await?;
    greeting.write_all(HELLO).await?;
    greeting.finish()?;
    Ok(ClientSession::new(
        SessionKind::QuicStreamPerFrame,
        MediaIngress::StreamPerFrame(StreamIngress { conn: conn.clone() }),
        FeedbackEgress::StreamPerFrame(StreamFeedbackSender {
            conn: conn.clone(),
            stream: None,
        }),
        Some((endpoint, conn)),
    ))
}

// ─── Framing ─────────────────────────────────────────────────────────────────

/// Read length-prefixed frames from `reader` and forward each payload to
/// `tx` until the reader ends. Partial reads are accumulated until the
/// declared length is complete; end of input between frames is a normal
/// finish, end of input inside a frame is an error. Zero-length frames are
/// skipped. Returns the number of frames delivered.
pub async fn read_length_prefixed<R>(
    reader: &mut R,
    tx: &mpsc::Sender<Bytes>,
    max_len: usize,
) -> Result<u64, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut delivered = 0u64;
    loop {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut filled = 0;
        while filled < FRAME_HEADER_LEN {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(delivered);
                }
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            filled += n;
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > max_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("feedback frame of {len} bytes exceeds {max_len}"),
            )
            .into());
        }
        if len == 0 {
            continue;
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        if tx.send(Bytes::from(payload)).await.is_err() {
            return Ok(delivered);
        }
        delivered += 1;
    }
}

/// Prefix `payload` with its big-endian length.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

// ─── Server side ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct StreamWriter {
    conn: quinn::Connection,
    probe: Option<AckProbe>,
}

impl StreamWriter {
    pub fn new(conn: quinn::Connection, probe: Option<AckProbe>) -> Self {
        StreamWriter { conn, probe }
    }

    pub(super) async fn write(&mut self, packet: Bytes) -> Result<usize, SessionError> {
        let len = packet.len();
        let mut stream = self.conn.open_uni().await?;
        let seq = peek_sequence(&packet);
        if let (Some(probe), Some(seq)) = (&self.probe, seq) {
            probe.note_media(seq);
        }
        if let Err(e) = stream.write_all(&packet).await {
            if let (Some(probe), Some(seq)) = (&self.probe, seq) {
                probe.retract_media(seq);
            }
            if !matches!(e, quinn::WriteError::ConnectionLost(_)) {
                close_with_error(&self.conn, &e);
            }
            return Err(e.into());
        }
        stream.finish()?;
        Ok(len)
    }

    pub(super) fn close(&mut self) {
        close_end_of_stream(&self.conn);
    }
}

#[derive(Debug)]
pub struct StreamFeedback {
    conn: quinn::Connection,
}

impl StreamFeedback {
    pub(super) async fn run(self, tx: mpsc::Sender<Bytes>, mut shutdown: ShutdownSignal) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                bi = self.conn.accept_bi() => match bi {
                    Ok((_send, mut recv)) => {
                        let greeting = recv.read_to_end(64).await.unwrap_or_default();
                        tracing::debug!(len = greeting.len(), "client greeting received");
                    }
                    Err(e) => return Err(self.fail(e)),
                },
                uni = self.conn.accept_uni() => match uni {
                    Ok(mut recv) => {
                        tokio::select! {
                            _ = shutdown.wait() => return Ok(()),
                            read = read_length_prefixed(&mut recv, &tx, MAX_FEEDBACK_LEN) => {
                                if let Err(e) = read {
                                    return Err(self.stream_failure(e));
                                }
                                if tx.is_closed() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Err(e) => return Err(self.fail(e)),
                },
            }
        }
    }

    fn fail(&self, e: quinn::ConnectionError) -> SessionError {
        if !super::is_clean_close(&e) {
            close_with_error(&self.conn, &e);
        }
        e.into()
    }

    /// Stream reads surface as I/O errors; recover the connection-level
    /// cause when there is one.
    fn stream_failure(&self, e: SessionError) -> SessionError {
        match self.conn.close_reason() {
            Some(reason) => reason.into(),
            None => {
                close_with_error(&self.conn, &e);
                e
            }
        }
    }
}

// ─── Client side ─────────────────────────────────────────────────────────────

/// Client-side media ingress.
#[derive(Debug)]
pub struct StreamIngress {
    conn: quinn::Connection,
}

impl StreamIngress {
    pub(super) async fn next(&mut self) -> Result<Option<Bytes>, SessionError> {
        let mut recv = self.conn.accept_uni().await?;
        let packet = recv.read_to_end(MAX_MEDIA_LEN).await?;
        Ok(Some(Bytes::from(packet)))
    }
}

/// Client-side feedback egress. Opens its stream on first use.
#[derive(Debug)]
pub struct StreamFeedbackSender {
    conn: quinn::Connection,
    stream: Option<quinn::SendStream>,
}

impl StreamFeedbackSender {
    pub(super) async fn send(&mut self, feedback: Bytes) -> Result<(), SessionError> {
        if self.stream.is_none() {
            self.stream = Some(self.conn.open_uni().await?);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(SessionError::Closed);
        };
        stream.write_all(&frame(&feedback)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_multiple_frames_across_partial_reads() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&frame(b"abc"));
        wire.extend_from_slice(&frame(b""));
        wire.extend_from_slice(&frame(b"defgh"));
        let mut reader = OneByteReader(&wire);
        let (tx, mut rx) = mpsc::channel(8);
        let n = read_length_prefixed(&mut reader, &tx, 1024).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"defgh"));
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let mut reader = &[0u8, 0, 0, 9, 1, 2][..];
        let (tx, _rx) = mpsc::channel(8);
        assert!(read_length_prefixed(&mut reader, &tx, 1024).await.is_err());
    }

    #[tokio::test]
    async fn truncated_header_is_an_error() {
        let mut reader = &[0u8, 0][..];
        let (tx, _rx) = mpsc::channel(8);
        assert!(read_length_prefixed(&mut reader, &tx, 1024).await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut reader = &[0u8, 1, 0, 0][..];
        let (tx, _rx) = mpsc::channel(8);
        assert!(read_length_prefixed(&mut reader, &tx, 1024).await.is_err());
    }

    /// Yields one byte per read call.
    struct OneByteReader<'a>(&'a [u8]);

    impl AsyncRead for OneByteReader<'_> {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if let Some((first, rest)) = self.0.split_first() {
                buf.put_slice(&[*first]);
                self.0 = rest;
            }
            std::task::Poll::Ready(Ok(()))
        }
    }
}
