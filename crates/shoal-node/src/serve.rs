//! `shoal serve`: accept peers and stream synthetic media to each.
//!
//! Per peer:
//!
//! ```text
//!   SyntheticSource ──► PacedSender ──► SessionWriter ──► peer
//!         ▲                  ▲   ▲
//!   run_bitrate_loop ────────┘   └── FeedbackReader ◄── peer
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use shoal_transport::bitrate::run_bitrate_loop;
use shoal_transport::clock::NtpClock;
use shoal_transport::engine::PassThroughEngine;
use shoal_transport::quic::QuicServer;
use shoal_transport::sender::PacedSender;
use shoal_transport::session::{datagram, stream, Session, SessionKind, UdpListener};
use shoal_transport::shutdown::ShutdownSignal;
use tokio::task::JoinSet;

use crate::config::NodeConfig;
use crate::source::SyntheticSource;

pub async fn run(config: NodeConfig, addr: SocketAddr, mut shutdown: ShutdownSignal) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let clock = NtpClock::new();
    let kind = config.transport.session.kind;
    let mut peers = JoinSet::new();

    match kind {
        SessionKind::Udp => {
            let mut listener = UdpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind udp {addr}"))?;
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    session = listener.accept() => match session {
                        Some(session) => {
                            peers.spawn(serve_peer(session, config.clone(), clock, shutdown.clone()));
                        }
                        None => break,
                    },
                }
            }
        }
        SessionKind::QuicDatagram | SessionKind::QuicStreamPerFrame => {
            let server = QuicServer::bind(addr, clock).with_context(|| format!("failed to bind quic {addr}"))?;
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.wait() => break,
                    accepted = server.accept() => accepted,
                };
                let conn = match accepted {
                    Ok(Some(conn)) => conn,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "quic handshake failed");
                        continue;
                    }
                };
                let session = match kind {
                    SessionKind::QuicStreamPerFrame => stream::session(conn),
                    _ => datagram::session(conn),
                };
                peers.spawn(serve_peer(session, config.clone(), clock, shutdown.clone()));
            }
            while let Some(joined) = peers.join_next().await {
                log_peer_result(joined);
            }
            server.close();
            server.wait_idle(config.transport.session.close_grace).await;
            return Ok(());
        }
    }

    while let Some(joined) = peers.join_next().await {
        log_peer_result(joined);
    }
    Ok(())
}

fn log_peer_result(joined: Result<anyhow::Result<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %format!("{e:#}"), "peer ended with error"),
        Err(e) => tracing::warn!(error = %e, "peer task failed"),
    }
}

async fn serve_peer(
    session: Session,
    config: Arc<NodeConfig>,
    clock: NtpClock,
    shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let Session {
        kind,
        peer,
        writer,
        feedback,
        acks,
    } = session;
    tracing::info!(%peer, %kind, "peer connected");

    let sender_config = config.transport.sender.clone();
    let initial_bps = sender_config.pacer.initial_rate_bps;
    let ssrc = sender_config.pacer.ssrc;
    let engine = PassThroughEngine::new(initial_bps);
    let (sender, handle) = PacedSender::new(sender_config, engine, writer, clock, acks, shutdown.clone());

    let (control, source) = SyntheticSource::new(config.media, ssrc, initial_bps as u64);
    let stats_sink = config
        .transport
        .bitrate
        .stats_sink
        .open()
        .context("failed to open stats sink")?;

    let sender_task = tokio::spawn(sender.run());
    let feedback_task = tokio::spawn(feedback.run(handle.feedback.clone(), shutdown.clone()));
    let bitrate_task = tokio::spawn(run_bitrate_loop(
        config.transport.bitrate.clone(),
        handle.queries.clone(),
        control,
        stats_sink,
        clock,
        shutdown.clone(),
    ));
    let source_task = tokio::spawn(source.run(handle.media.clone(), shutdown));
    drop(handle);

    // The sender ends on shutdown or when the session fails; everything
    // else follows it.
    let stats = sender_task.await.context("sender task panicked")?;
    feedback_task.abort();
    let frames = source_task.await.unwrap_or_default();
    let last_bps = bitrate_task.await.unwrap_or_default();
    match feedback_task.await {
        Ok(Err(e)) => tracing::warn!(%peer, error = %e, "feedback session failed"),
        Ok(Ok(())) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::warn!(%peer, error = %e, "feedback task failed"),
    }

    tracing::info!(
        %peer,
        frames,
        last_bitrate_bps = last_bps.unwrap_or_default(),
        stats = %serde_json::to_string(&stats).context("failed to encode stats")?,
        "peer finished"
    );
    Ok(())
}
