//! # Plain UDP Session
//!
//! One socket serves every peer. A demux task owns the receive side:
//!
//! ```text
//!            recv_from(peer)
//!   socket ─────────────────► demux ──► known peer?  ── yes ─► peer feedback mpsc
//!                                          │
//!                                          └─ no ─► new Session (datagram dropped)
//! ```
//!
//! The dialing client announces itself with a greeting datagram. The sender
//! ends the stream with a single `eos` datagram.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    ClientSession, FeedbackEgress, FeedbackReader, MediaIngress, Session, SessionKind,
    SessionWriter, EOS_REASON, HELLO,
};
use crate::error::SessionError;
use crate::shutdown::ShutdownSignal;

/// Receive buffer size; larger than any UDP payload.
const RECV_BUF_SIZE: usize = 65_536;

/// Feedback datagrams buffered per peer before new ones are dropped.
const PEER_CHANNEL_CAPACITY: usize = 64;

/// Period of the sweep that forgets peers whose session has ended.
const PEER_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Listening UDP socket handing out one [`Session`] per new peer.
#[derive(Debug)]
pub struct UdpListener {
    local_addr: SocketAddr,
    sessions: mpsc::Receiver<Session>,
    tracked: Arc<AtomicUsize>,
    demux: JoinHandle<()>,
}

impl UdpListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, SessionError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (tx, sessions) = mpsc::channel(16);
        let peers = PeerTable::default();
        let tracked = peers.tracked.clone();
        let demux = tokio::spawn(demux(socket, tx, peers));
        tracing::info!(addr = %local_addr, "udp server listening");
        Ok(UdpListener {
            local_addr,
            sessions,
            tracked,
            demux,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peers the demux currently routes feedback to.
    pub fn peer_count(&self) -> usize {
        self.tracked.load(Ordering::Relaxed)
    }

    /// Next new peer. `None` once the socket failed.
    pub async fn accept(&mut self) -> Option<Session> {
        self.sessions.recv().await
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

/// Feedback routes of the demux, keyed by peer address. A route is dead
/// once its session dropped the feedback receiver.
#[derive(Debug, Default)]
struct PeerTable {
    routes: HashMap<SocketAddr, mpsc::Sender<Bytes>>,
    tracked: Arc<AtomicUsize>,
}

impl PeerTable {
    fn get(&self, peer: &SocketAddr) -> Option<&mpsc::Sender<Bytes>> {
        self.routes.get(peer)
    }

    fn insert(&mut self, peer: SocketAddr, route: mpsc::Sender<Bytes>) {
        self.prune();
        self.routes.insert(peer, route);
        self.publish();
    }

    fn remove(&mut self, peer: &SocketAddr) {
        self.routes.remove(peer);
        self.publish();
    }

    /// Forget every peer whose session has ended. Returns how many.
    fn prune(&mut self) -> usize {
        let before = self.routes.len();
        self.routes.retain(|peer, route| {
            let open = !route.is_closed();
            if !open {
                tracing::debug!(%peer, "udp peer forgotten");
            }
            open
        });
        self.publish();
        before - self.routes.len()
    }

    fn len(&self) -> usize {
        self.routes.len()
    }

    fn publish(&self) {
        self.tracked.store(self.routes.len(), Ordering::Relaxed);
    }
}

async fn demux(socket: Arc<UdpSocket>, sessions: mpsc::Sender<Session>, mut peers: PeerTable) {
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    let mut sweep = tokio::time::interval(PEER_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let received = tokio::select! {
            _ = sweep.tick() => {
                let forgotten = peers.prune();
                if forgotten > 0 {
                    tracing::debug!(forgotten, remaining = peers.len(), "udp peer sweep");
                }
                continue;
            }
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, peer) = match received {
            Ok(r) => r,
            Err(e) => {
                // ICMP unreachable surfaces here on some platforms.
                if e.kind() == std::io::ErrorKind::ConnectionReset {
                    continue;
                }
                tracing::warn!(error = %e, "udp receive failed");
                return;
            }
        };
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        if let Some(feedback) = peers.get(&peer) {
            match feedback.try_send(datagram) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!(%peer, "peer feedback channel full, datagram dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(%peer, "udp peer forgotten");
                    peers.remove(&peer);
                }
            }
            continue;
        }

        if datagram != HELLO {
            tracing::debug!(%peer, len = n, "new udp peer without greeting");
        }
        let (tx, rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        peers.insert(peer, tx);
        let session = Session {
            kind: SessionKind::Udp,
            peer,
            writer: SessionWriter::Udp(UdpWriter {
                socket: socket.clone(),
                peer,
            }),
            feedback: FeedbackReader::Udp(UdpFeedback { rx }),
            acks: None,
        };
        tracing::info!(%peer, "udp session accepted");
        if sessions.send(session).await.is_err() {
            return;
        }
    }
}

/// Dial a UDP server and greet it.
pub(crate) async fn connect(addr: SocketAddr) -> Result<ClientSession, SessionError> {
    let bind: SocketAddr = if addr.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let socket = Arc::new(UdpSocket::bind(bind).await?);
    socket.connect(addr).await?;
    socket.send(HELLO).await?;
    Ok(ClientSession::new(
        SessionKind::Udp,
        MediaIngress::Udp(UdpIngress {
            socket: socket.clone(),
            buf: vec![0u8; RECV_BUF_SIZE],
        }),
        FeedbackEgress::Udp(UdpFeedbackSender { socket }),
        None,
    ))
}

// ─── Server side ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct UdpWriter {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpWriter {
    pub(super) async fn write(&mut self, packet: Bytes) -> Result<usize, SessionError> {
        Ok(self.socket.send_to(&packet, self.peer).await?)
    }

    pub(super) async fn close(&mut self) -> Result<(), SessionError> {
        self.socket.send_to(EOS_REASON, self.peer).await?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct UdpFeedback {
    rx: mpsc::Receiver<Bytes>,
}

impl UdpFeedback {
    pub(super) async fn run(mut self, tx: mpsc::Sender<Bytes>, mut shutdown: ShutdownSignal) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                feedback = self.rx.recv() => match feedback {
                    Some(feedback) => {
                        if tx.send(feedback).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => return Err(SessionError::Closed),
                },
            }
        }
    }
}

// ─── Client side ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct UdpIngress {
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
}

impl UdpIngress {
    pub(super) async fn next(&mut self) -> Result<Option<Bytes>, SessionError> {
        let n = self.socket.recv(&mut self.buf).await?;
        let datagram = &self.buf[..n];
        if datagram == EOS_REASON {
            return Err(SessionError::EndOfStream);
        }
        Ok(Some(Bytes::copy_from_slice(datagram)))
    }
}

#[derive(Debug)]
pub struct UdpFeedbackSender {
    socket: Arc<UdpSocket>,
}

impl UdpFeedbackSender {
    pub(super) async fn send(&mut self, feedback: Bytes) -> Result<(), SessionError> {
        self.socket.send(&feedback).await?;
        Ok(())
    }
}
