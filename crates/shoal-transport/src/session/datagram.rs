//! QUIC datagram session: one unreliable datagram per media packet, feedback
//! as datagrams in the reverse direction.

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{
    close_end_of_stream, close_with_error, ClientSession, FeedbackEgress, FeedbackReader,
    MediaIngress, Session, SessionKind, SessionWriter,
};
use crate::error::SessionError;
use crate::media::{peek_sequence, RTP_HEADER_SIZE};
use crate::quic::{AckProbe, QuicConnection};
use crate::shutdown::ShutdownSignal;

/// Build the server half of a datagram session.
pub fn session(accepted: QuicConnection) -> Session {
    let QuicConnection {
        connection,
        probe,
        acks,
    } = accepted;
    Session {
        kind: SessionKind::QuicDatagram,
        peer: connection.remote_address(),
        writer: SessionWriter::Datagram(DatagramWriter {
            conn: connection.clone(),
            probe: Some(probe),
        }),
        feedback: FeedbackReader::Datagram(DatagramFeedback { conn: connection }),
        acks: Some(acks),
    }
}

pub(crate) fn client_session(endpoint: quinn::Endpoint, conn: quinn::Connection) -> ClientSession {
    ClientSession::new(
        SessionKind::QuicDatagram,
        MediaIngress::Datagram(DatagramIngress { conn: conn.clone() }),
        FeedbackEgress::Datagram(DatagramFeedbackSender { conn: conn.clone() }),
        Some((endpoint, conn)),
    )
}

#[derive(Debug)]
pub struct DatagramWriter {
    conn: quinn::Connection,
    probe: Option<AckProbe>,
}

impl DatagramWriter {
    pub fn new(conn: quinn::Connection, probe: Option<AckProbe>) -> Self {
        DatagramWriter { conn, probe }
    }

    pub(super) fn write(&mut self, packet: Bytes) -> Result<usize, SessionError> {
        let len = packet.len();
        // Announced before the send so the connection driver cannot build
        // the packet ahead of the note.
        let noted = match (&self.probe, peek_sequence(&packet)) {
            (Some(probe), Some(seq)) => {
                probe.note_media(seq);
                Some((probe, seq))
            }
            _ => None,
        };
        if let Err(e) = self.conn.send_datagram(packet) {
            if let Some((probe, seq)) = noted {
                probe.retract_media(seq);
            }
            return Err(e.into());
        }
        Ok(len)
    }

    pub(super) fn close(&mut self) {
        close_end_of_stream(&self.conn);
    }
}

#[derive(Debug)]
pub struct DatagramFeedback {
    conn: quinn::Connection,
}

impl DatagramFeedback {
    pub(super) async fn run(self, tx: mpsc::Sender<Bytes>, mut shutdown: ShutdownSignal) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                read = self.conn.read_datagram() => match read {
                    Ok(feedback) => {
                        if tx.send(feedback).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        if !super::is_clean_close(&e) {
                            close_with_error(&self.conn, &e);
                        }
                        return Err(e.into());
                    }
                },
            }
        }
    }
}

/// Client-side media ingress.
#[derive(Debug)]
pub struct DatagramIngress {
    conn: quinn::Connection,
}

impl DatagramIngress {
    pub(super) async fn next(&mut self) -> Result<Option<Bytes>, SessionError> {
        loop {
            let datagram = self.conn.read_datagram().await?;
            if datagram.len() < RTP_HEADER_SIZE {
                tracing::trace!(len = datagram.len(), "short datagram skipped");
                continue;
            }
            return Ok(Some(datagram));
        }
    }
}

/// Client-side feedback egress.
#[derive(Debug)]
pub struct DatagramFeedbackSender {
    conn: quinn::Connection,
}

impl DatagramFeedbackSender {
    pub(super) fn send(&mut self, feedback: Bytes) -> Result<(), SessionError> {
        self.conn.send_datagram(feedback)?;
        Ok(())
    }
}
