//! # QUIC Endpoints
//!
//! Server and client endpoint setup shared by both QUIC session variants.
//! Every accepted connection gets its own transport config so its congestion
//! controller carries a fresh [`probe::AckProbe`].

pub mod probe;
pub mod tls;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use tokio::sync::mpsc;

use crate::clock::NtpClock;
use crate::correlator::AckedPacket;
use crate::error::SessionError;

pub use probe::AckProbe;

/// Concurrent unidirectional streams a peer may open.
pub const MAX_CONCURRENT_UNI_STREAMS: u32 = 10_000;

/// Keep-alive interval on idle connections.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

fn transport_config(factory: Option<Arc<probe::ProbeFactory>>) -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport.max_concurrent_uni_streams(quinn::VarInt::from_u32(MAX_CONCURRENT_UNI_STREAMS));
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    if let Some(factory) = factory {
        transport.congestion_controller_factory(factory);
    }
    transport
}

/// An accepted connection and its ACK observation channel.
#[derive(Debug)]
pub struct QuicConnection {
    pub connection: quinn::Connection,
    pub probe: AckProbe,
    pub acks: mpsc::Receiver<Vec<AckedPacket>>,
}

/// Listening QUIC endpoint.
pub struct QuicServer {
    endpoint: quinn::Endpoint,
    crypto: Arc<QuicServerConfig>,
    clock: NtpClock,
}

impl QuicServer {
    /// Bind a QUIC server on `addr`. ACK timestamps are taken from `clock`,
    /// which must be the clock the sender uses.
    pub fn bind(addr: SocketAddr, clock: NtpClock) -> Result<Self, SessionError> {
        let crypto = tls::server_crypto()?;
        let crypto = Arc::new(
            QuicServerConfig::try_from(crypto).map_err(|e| SessionError::Tls(e.to_string()))?,
        );
        let mut server_config = quinn::ServerConfig::with_crypto(crypto.clone());
        server_config.transport_config(Arc::new(transport_config(None)));
        let endpoint = quinn::Endpoint::server(server_config, addr)?;
        tracing::info!(addr = %endpoint.local_addr()?, "quic server listening");
        Ok(QuicServer {
            endpoint,
            crypto,
            clock,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Wait for the next connection. `None` once the endpoint is closed.
    pub async fn accept(&self) -> Result<Option<QuicConnection>, SessionError> {
        let Some(incoming) = self.endpoint.accept().await else {
            return Ok(None);
        };
        let (factory, probe, acks) = probe::probe(self.clock);
        let mut config = quinn::ServerConfig::with_crypto(self.crypto.clone());
        config.transport_config(Arc::new(transport_config(Some(factory))));
        let connection = incoming.accept_with(Arc::new(config))?.await?;
        tracing::info!(peer = %connection.remote_address(), "quic connection accepted");
        Ok(Some(QuicConnection {
            connection,
            probe,
            acks,
        }))
    }

    /// Stop accepting and close every connection.
    pub fn close(&self) {
        self.endpoint
            .close(quinn::VarInt::from_u32(crate::session::close_code::NORMAL), b"");
    }

    /// Wait up to `grace` for closing connections to reach their peers.
    pub async fn wait_idle(&self, grace: Duration) {
        if tokio::time::timeout(grace, self.endpoint.wait_idle()).await.is_err() {
            tracing::debug!("quic endpoint still busy after close grace");
        }
    }
}

/// Dial a QUIC server. The endpoint is returned so it outlives the
/// connection.
pub async fn connect(addr: SocketAddr) -> Result<(quinn::Endpoint, quinn::Connection), SessionError> {
    let crypto = QuicClientConfig::try_from(tls::client_crypto())
        .map_err(|e| SessionError::Tls(e.to_string()))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport_config(None)));

    let bind: SocketAddr = if addr.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let endpoint = quinn::Endpoint::client(bind)?;
    let connection = endpoint
        .connect_with(client_config, addr, tls::SERVER_NAME)?
        .await?;
    tracing::info!(server = %addr, "quic connection established");
    Ok((endpoint, connection))
}
