//! Layered application configuration.
//!
//! Values come from `config/duocast.toml` (optional) overlaid with
//! `DUOCAST_`-prefixed environment variables. Every tunable the quality and
//! reconnection paths consume has a serde default matching the numbers the
//! system was validated with; deployments may override them.

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::LatencyProfile;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub ice: IceConfig,
    pub peer: PeerConfig,
    pub quality: QualityConfig,
    pub host: HostConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs handed to every peer transport
    pub stun_servers: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

/// Negotiation and reconnection tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Minimum time between reconnection attempts for one participant (ms)
    pub reconnect_cooldown_ms: u64,
    /// Delay before a scheduled retry builds its fresh transport (ms)
    pub retry_delay_ms: u64,
    /// Telemetry sampling interval per role (ms)
    pub telemetry_interval_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            reconnect_cooldown_ms: 1_500,
            retry_delay_ms: 250,
            telemetry_interval_ms: 1_000,
        }
    }
}

/// Adaptive quality tunables. Thresholds are role-agnostic; baselines differ
/// by role and latency profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Fractional packet loss above which the link is `poor`
    pub poor_loss: f64,
    /// RTT (ms) above which the link is `poor`
    pub poor_rtt_ms: f64,
    /// Jitter (ms) above which the link is `poor`
    pub poor_jitter_ms: f64,
    pub fair_loss: f64,
    pub fair_rtt_ms: f64,
    pub fair_jitter_ms: f64,

    /// Bitrate fraction of baseline applied in the `poor` tier
    pub poor_bitrate_fraction: f64,
    pub poor_fps_fraction: f64,
    pub fair_bitrate_fraction: f64,
    pub fair_fps_fraction: f64,

    /// Frame-rate floor enforced for the controller role while health is not
    /// `poor`
    pub controller_fps_floor: u32,

    /// Minimum deltas before a new target is applied to the live sender
    pub apply_bitrate_delta: u32,
    pub apply_fps_delta: u32,
    pub apply_scale_delta: f64,

    /// Minimum interval between display-agent resizes triggered by viewer
    /// capability messages (ms)
    pub resize_min_interval_ms: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            poor_loss: 0.03,
            poor_rtt_ms: 85.0,
            poor_jitter_ms: 28.0,
            fair_loss: 0.01,
            fair_rtt_ms: 45.0,
            fair_jitter_ms: 14.0,
            poor_bitrate_fraction: 0.5,
            poor_fps_fraction: 0.6,
            fair_bitrate_fraction: 0.72,
            fair_fps_fraction: 0.8,
            controller_fps_floor: 45,
            apply_bitrate_delta: 150_000,
            apply_fps_delta: 1,
            apply_scale_delta: 0.05,
            resize_min_interval_ms: 4_000,
        }
    }
}

/// Host-engine settings for this process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Run the in-process host engine (negotiation + quality control)
    pub enabled: bool,
    pub latency_profile: LatencyProfile,
    /// Adapt encoding targets from live telemetry
    pub auto_tune: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            latency_profile: LatencyProfile::LowLatency,
            auto_tune: true,
        }
    }
}

/// External display agent endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the display agent; None disables agent integration
    pub base_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 3_000,
        }
    }
}

impl Config {
    /// Load configuration from the optional config file and environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/duocast")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let builder = ConfigBuilder::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix("DUOCAST").separator("__"))
            .build()?;

        builder.try_deserialize()
    }

    /// Validate invariants the rest of the system assumes. Returns every
    /// violation so operators can fix them in one pass.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }
        if self.quality.fair_loss > self.quality.poor_loss {
            errors.push("quality.fair_loss must not exceed quality.poor_loss".to_string());
        }
        if self.quality.fair_rtt_ms > self.quality.poor_rtt_ms {
            errors.push("quality.fair_rtt_ms must not exceed quality.poor_rtt_ms".to_string());
        }
        if self.quality.fair_jitter_ms > self.quality.poor_jitter_ms {
            errors.push("quality.fair_jitter_ms must not exceed quality.poor_jitter_ms".to_string());
        }
        for (name, fraction) in [
            ("poor_bitrate_fraction", self.quality.poor_bitrate_fraction),
            ("poor_fps_fraction", self.quality.poor_fps_fraction),
            ("fair_bitrate_fraction", self.quality.fair_bitrate_fraction),
            ("fair_fps_fraction", self.quality.fair_fps_fraction),
        ] {
            if !(0.0..=1.0).contains(&fraction) {
                errors.push(format!("quality.{name} must be within 0.0..=1.0"));
            }
        }
        if self.host.enabled && self.ice.stun_servers.is_empty() {
            errors.push("ice.stun_servers must not be empty when host.enabled".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
