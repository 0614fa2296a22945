//! Stream telemetry and quality classification types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of telemetry samples retained per role.
pub const STATS_HISTORY_LEN: usize = 60;

/// One transport telemetry sample, produced once per second per role and
/// consumed immediately by the quality controller. Only a bounded rolling
/// history is retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    /// Current encoded resolution, `WxH`, or `---` when unknown
    pub resolution: String,
    pub fps: f64,
    /// Outbound bitrate in bits per second
    pub bitrate: u64,
    /// Round-trip time estimate in milliseconds
    pub rtt: f64,
    /// Fractional packet loss over the last sampling interval (0.0 - 1.0)
    pub packet_loss: f64,
    /// Jitter in milliseconds
    pub jitter: f64,
    pub timestamp: DateTime<Utc>,
}

impl StreamStats {
    #[must_use]
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            resolution: "---".to_string(),
            fps: 0.0,
            bitrate: 0,
            rtt: 0.0,
            packet_loss: 0.0,
            jitter: 0.0,
            timestamp,
        }
    }
}

/// Encoding posture selected by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LatencyProfile {
    #[default]
    LowLatency,
    Balanced,
}

/// Link health tier driving adaptive encoding targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkHealth {
    #[default]
    Unknown,
    Good,
    Fair,
    Poor,
}
