//! # shoal-transport
//!
//! Congestion-feedback-aware real-time media transport.
//!
//! Paces RTP-framed media under an external congestion engine's admission
//! decisions, carries RFC 8888-style CC feedback reports, synthesises those
//! reports from QUIC acknowledgments when the receiver only reports its
//! newest packet, and runs over QUIC datagrams, QUIC stream-per-frame or
//! plain UDP.
//!
//! ## Crate structure
//!
//! - [`clock`] — NTP Q16.16 session clock
//! - [`media`] — RTP media packets, media source/sink traits
//! - [`queue`] — FIFO packet queue
//! - [`feedback`] — CC feedback codec, minimal feedback, report builder
//! - [`engine`] — Congestion engine contract, pass-through engine
//! - [`pacer`] — Paced sender state machine
//! - [`correlator`] — QUIC packet number to media sequence correlation
//! - [`infer`] — Receive-time inference policies and sent-packet table
//! - [`session`] — Transport session variants
//! - [`quic`] — QUIC endpoints, TLS bootstrap, ACK probe
//! - [`sender`] — Async paced sender task
//! - [`bitrate`] — Bitrate feedback loop
//! - [`receiver`] — Media receiver and feedback reporter
//! - [`config`] — TOML configuration
//! - [`stats`] — Sender and receiver statistics
//! - [`shutdown`] — Shutdown signal

pub mod bitrate;
pub mod clock;
pub mod config;
pub mod correlator;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod infer;
pub mod media;
pub mod pacer;
pub mod queue;
pub mod quic;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod shutdown;
pub mod stats;
