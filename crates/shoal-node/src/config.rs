//! Node configuration: the transport sections plus `[media]`, with
//! command-line overrides applied before resolution.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use shoal_transport::config::{TransportConfig, TransportConfigInput};
use shoal_transport::error::ConfigError;
use shoal_transport::media::RTP_HEADER_SIZE;

/// Largest packet that still fits a QUIC datagram on a 1280-byte path.
pub const DEFAULT_PACKET_SIZE: usize = 1100;
pub const DEFAULT_FRAME_RATE: u32 = 30;
const MAX_FRAME_RATE: u32 = 240;
const MAX_PACKET_SIZE: usize = 65_507;

// ─── Input ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MediaConfigInput {
    pub frame_rate: Option<u32>,
    /// Wire size of a full media packet, header included.
    pub packet_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MediaSection {
    media: MediaConfigInput,
}

/// Values given on the command line. Each one replaces its TOML key.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub address: Option<String>,
    pub session: Option<String>,
    pub feedback: Option<String>,
    pub stats_sink: Option<String>,
    pub initial_bitrate_kbps: Option<u64>,
    pub frame_rate: Option<u32>,
    pub packet_size: Option<usize>,
}

impl Overrides {
    fn apply(&self, transport: &mut TransportConfigInput, media: &mut MediaConfigInput) {
        if let Some(address) = &self.address {
            transport.session.address = Some(address.clone());
        }
        if let Some(kind) = &self.session {
            transport.session.kind = Some(kind.clone());
        }
        if let Some(mode) = &self.feedback {
            transport.feedback.mode = Some(mode.clone());
        }
        if let Some(sink) = &self.stats_sink {
            transport.bitrate.stats_sink = Some(sink.clone());
        }
        if let Some(kbps) = self.initial_bitrate_kbps {
            transport.sender.initial_bitrate_kbps = Some(kbps);
        }
        if let Some(fps) = self.frame_rate {
            media.frame_rate = Some(fps);
        }
        if let Some(size) = self.packet_size {
            media.packet_size = Some(size);
        }
    }
}

// ─── Resolved ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConfig {
    pub frame_rate: u32,
    pub packet_size: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig {
            frame_rate: DEFAULT_FRAME_RATE,
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

impl MediaConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate
    }
}

impl MediaConfigInput {
    fn resolve(self) -> Result<MediaConfig, ConfigError> {
        let defaults = MediaConfig::default();
        let frame_rate = self.frame_rate.unwrap_or(defaults.frame_rate);
        if frame_rate == 0 || frame_rate > MAX_FRAME_RATE {
            return Err(ConfigError::Invalid {
                field: "media.frame_rate",
                reason: format!("must be between 1 and {MAX_FRAME_RATE}"),
            });
        }
        let packet_size = self.packet_size.unwrap_or(defaults.packet_size);
        if packet_size <= RTP_HEADER_SIZE || packet_size > MAX_PACKET_SIZE {
            return Err(ConfigError::Invalid {
                field: "media.packet_size",
                reason: format!("must be between {} and {MAX_PACKET_SIZE}", RTP_HEADER_SIZE + 1),
            });
        }
        Ok(MediaConfig {
            frame_rate,
            packet_size,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub transport: TransportConfig,
    pub media: MediaConfig,
}

impl NodeConfig {
    pub fn from_toml_str(input: &str, overrides: &Overrides) -> Result<Self, ConfigError> {
        let (mut transport, mut media) = if input.trim().is_empty() {
            (TransportConfigInput::default(), MediaConfigInput::default())
        } else {
            let transport: TransportConfigInput =
                toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
            let section: MediaSection =
                toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
            (transport, section.media)
        };
        overrides.apply(&mut transport, &mut media);
        Ok(NodeConfig {
            transport: transport.resolve()?,
            media: media.resolve()?,
        })
    }

    /// Load from `path`, or defaults when no file is given.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<Self> {
        let text = match path {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?,
            None => String::new(),
        };
        NodeConfig::from_toml_str(&text, overrides).context("invalid configuration")
    }
}
