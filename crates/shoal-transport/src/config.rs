//! TOML configuration: `*Input` structs mirror the file, `resolve()` turns
//! them into validated runtime configs with defaults filled in.

use std::time::Duration;

use serde::Deserialize;

use crate::bitrate::{BitrateConfig, StatsSink};
use crate::error::ConfigError;
use crate::infer::{FeedbackMode, InferenceConfig, InferencePolicy};
use crate::pacer::PacerConfig;
use crate::receiver::{ReceiverConfig, ReporterMode, DEFAULT_FEEDBACK_INTERVAL};
use crate::sender::SenderConfig;
use crate::session::SessionKind;

pub const CONFIG_VERSION: u32 = 1;

/// Default server address.
pub const DEFAULT_ADDRESS: &str = "localhost:4242";

// ─── Input ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    pub version: u32,
    pub session: SessionConfigInput,
    pub sender: SenderConfigInput,
    pub feedback: FeedbackConfigInput,
    pub bitrate: BitrateConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfigInput {
    pub kind: Option<String>,
    pub address: Option<String>,
    pub close_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SenderConfigInput {
    pub ssrc: Option<u32>,
    pub initial_bitrate_kbps: Option<u64>,
    pub min_bitrate_kbps: Option<u64>,
    pub max_bitrate_kbps: Option<u64>,
    pub queue_capacity: Option<usize>,
    pub pacing_epsilon_us: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeedbackConfigInput {
    pub mode: Option<String>,
    pub interval_ms: Option<u64>,
    pub immediate: Option<bool>,
    /// Receiver sends minimal feedback. Defaults to true in inference modes.
    pub minimal: Option<bool>,
    pub receiver_ssrc: Option<u32>,
    pub static_offset: Option<u32>,
    pub static_window: Option<u32>,
    pub record_capacity: Option<usize>,
    pub record_max_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BitrateConfigInput {
    pub tick_ms: Option<u64>,
    pub request_key_frames: Option<bool>,
    pub stats_sink: Option<String>,
}

// ─── Resolved ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub kind: SessionKind,
    pub address: String,
    /// How long an endpoint lingers after closing so the close reaches the
    /// peer.
    pub close_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            kind: SessionKind::default(),
            address: DEFAULT_ADDRESS.to_string(),
            close_grace: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub version: u32,
    pub session: SessionConfig,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
    pub bitrate: BitrateConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            session: SessionConfig::default(),
            sender: SenderConfig::default(),
            receiver: ReceiverConfig::default(),
            bitrate: BitrateConfig::default(),
        }
    }
}

impl TransportConfigInput {
    pub fn resolve(self) -> Result<TransportConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::Version(version));
        }

        let session = self.session.resolve()?;
        let feedback_mode = resolve_feedback_mode(&self.feedback)?;
        let sender = self.sender.resolve(feedback_mode, &self.feedback)?;
        let receiver = resolve_receiver(feedback_mode, &self.feedback);
        let bitrate = self.bitrate.resolve();

        Ok(TransportConfig {
            version,
            session,
            sender,
            receiver,
            bitrate,
        })
    }
}

impl SessionConfigInput {
    fn resolve(self) -> Result<SessionConfig, ConfigError> {
        let defaults = SessionConfig::default();
        let kind = match self.kind.as_deref() {
            Some(kind) => kind.parse()?,
            None => defaults.kind,
        };
        let address = self
            .address
            .map(|a| a.trim().to_string())
            .unwrap_or(defaults.address);
        if address.is_empty() {
            return Err(ConfigError::Invalid {
                field: "session.address",
                reason: "must not be empty".into(),
            });
        }
        Ok(SessionConfig {
            kind,
            address,
            close_grace: self
                .close_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.close_grace),
        })
    }
}

impl SenderConfigInput {
    fn resolve(self, feedback_mode: FeedbackMode, feedback: &FeedbackConfigInput) -> Result<SenderConfig, ConfigError> {
        let defaults = SenderConfig::default();
        let pacer_defaults = PacerConfig::default();
        let kbps = |v: Option<u64>, d: f64| v.map(|k| k as f64 * 1000.0).unwrap_or(d);

        let min_rate_bps = kbps(self.min_bitrate_kbps, pacer_defaults.min_rate_bps);
        let max_rate_bps = kbps(self.max_bitrate_kbps, pacer_defaults.max_rate_bps);
        if min_rate_bps > max_rate_bps {
            return Err(ConfigError::Invalid {
                field: "sender.min_bitrate_kbps",
                reason: format!("{min_rate_bps} bps exceeds max {max_rate_bps} bps"),
            });
        }
        let initial_rate_bps = kbps(self.initial_bitrate_kbps, pacer_defaults.initial_rate_bps)
            .clamp(min_rate_bps, max_rate_bps);

        let pacer = PacerConfig {
            ssrc: self.ssrc.unwrap_or(pacer_defaults.ssrc),
            epsilon: self
                .pacing_epsilon_us
                .map(Duration::from_micros)
                .unwrap_or(pacer_defaults.epsilon),
            max_queue_len: self
                .queue_capacity
                .unwrap_or(pacer_defaults.max_queue_len)
                .max(1),
            min_rate_bps,
            max_rate_bps,
            initial_rate_bps,
        };

        let inference_defaults = InferenceConfig::default();
        let inference = InferenceConfig {
            ssrc: pacer.ssrc,
            policy: match feedback_mode {
                FeedbackMode::Infer(policy) => policy,
                FeedbackMode::Receive => inference_defaults.policy,
            },
            table_capacity: feedback
                .record_capacity
                .unwrap_or(inference_defaults.table_capacity)
                .max(1),
            max_record_age: feedback
                .record_max_age_ms
                .map(Duration::from_millis)
                .unwrap_or(inference_defaults.max_record_age),
        };

        Ok(SenderConfig {
            pacer,
            feedback_mode,
            inference,
            shutdown_grace: self
                .shutdown_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_grace),
            channel_capacity: defaults.channel_capacity,
        })
    }
}

fn resolve_feedback_mode(input: &FeedbackConfigInput) -> Result<FeedbackMode, ConfigError> {
    let mode = match input.mode.as_deref() {
        Some(mode) => mode.parse()?,
        None => FeedbackMode::default(),
    };
    Ok(match mode {
        FeedbackMode::Infer(InferencePolicy::StaticDelay { offset, window }) => {
            FeedbackMode::Infer(InferencePolicy::StaticDelay {
                offset: input.static_offset.unwrap_or(offset),
                window: input.static_window.unwrap_or(window),
            })
        }
        other => other,
    })
}

fn resolve_receiver(mode: FeedbackMode, input: &FeedbackConfigInput) -> ReceiverConfig {
    let defaults = ReceiverConfig::default();
    let interval = input
        .interval_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_FEEDBACK_INTERVAL);
    let minimal = input.minimal.unwrap_or(mode.is_inferred());
    ReceiverConfig {
        ssrc: input.receiver_ssrc.unwrap_or(defaults.ssrc),
        mode: if minimal {
            ReporterMode::Minimal { interval }
        } else {
            ReporterMode::Full {
                interval,
                immediate: input.immediate.unwrap_or(false),
            }
        },
        channel_capacity: defaults.channel_capacity,
    }
}

impl BitrateConfigInput {
    fn resolve(self) -> BitrateConfig {
        let defaults = BitrateConfig::default();
        BitrateConfig {
            tick: self
                .tick_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick)
                .max(Duration::from_millis(1)),
            request_key_frames: self.request_key_frames.unwrap_or(defaults.request_key_frames),
            stats_sink: match self.stats_sink.as_deref() {
                Some(sink) => sink.parse().unwrap_or_default(),
                None => defaults.stats_sink,
            },
        }
    }
}

impl TransportConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(TransportConfig::default());
        }
        let parsed: TransportConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        parsed.resolve()
    }
}
