//! Error types shared across the transport crate.

use thiserror::Error;

/// Failures while encoding or decoding wire messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("buffer too short: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("unexpected packet type {0}")]
    UnexpectedPacketType(u8),
    #[error("report block for ssrc {ssrc:#x} declares {declared} records but carries {actual}")]
    ReportCountMismatch {
        ssrc: u32,
        declared: u16,
        actual: usize,
    },
    #[error("report too large to encode ({0} bytes)")]
    TooLarge(usize),
    #[error("expected {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },
}

/// Failures raised by a transport session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer signalled end of stream. Not a failure.
    #[error("end of stream")]
    EndOfStream,
    #[error("session closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("quic connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),
    #[error("quic datagram send failed: {0}")]
    Datagram(#[from] quinn::SendDatagramError),
    #[error("quic stream write failed: {0}")]
    Write(#[from] quinn::WriteError),
    #[error("quic stream read failed: {0}")]
    Read(#[from] quinn::ReadExactError),
    #[error("quic stream read failed: {0}")]
    ReadToEnd(#[from] quinn::ReadToEndError),
    #[error("quic stream already closed")]
    ClosedStream(#[from] quinn::ClosedStream),
    #[error("quic connect failed: {0}")]
    Connect(#[from] quinn::ConnectError),
    #[error("tls setup failed: {0}")]
    Tls(String),
}

impl SessionError {
    /// True when the error represents a clean, peer-initiated close.
    pub fn is_clean_close(&self) -> bool {
        match self {
            SessionError::EndOfStream | SessionError::Closed => true,
            SessionError::Connection(e) => crate::session::is_clean_close(e),
            SessionError::Write(quinn::WriteError::ConnectionLost(e)) => {
                crate::session::is_clean_close(e)
            }
            SessionError::Read(quinn::ReadExactError::ReadError(
                quinn::ReadError::ConnectionLost(e),
            )) => crate::session::is_clean_close(e),
            SessionError::Datagram(quinn::SendDatagramError::ConnectionLost(e)) => {
                crate::session::is_clean_close(e)
            }
            SessionError::ReadToEnd(quinn::ReadToEndError::Read(
                quinn::ReadError::ConnectionLost(e),
            )) => crate::session::is_clean_close(e),
            _ => false,
        }
    }

    /// True when the session can no longer carry packets. Anything else
    /// costs only the packet being written.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::EndOfStream
            | SessionError::Closed
            | SessionError::Connection(_)
            | SessionError::Connect(_)
            | SessionError::Tls(_) => true,
            SessionError::Write(quinn::WriteError::ConnectionLost(_)) => true,
            SessionError::Datagram(e) => !matches!(e, quinn::SendDatagramError::TooLarge),
            SessionError::Read(quinn::ReadExactError::ReadError(quinn::ReadError::ConnectionLost(_))) => true,
            _ => false,
        }
    }
}

/// Invalid configuration input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(String),
    #[error("unsupported config version {0}")]
    Version(u32),
    #[error("unknown {field} value '{value}'")]
    UnknownVariant { field: &'static str, value: String },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
