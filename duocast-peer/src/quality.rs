//! Adaptive quality control.
//!
//! One controller per role, running once the role is connected. Every tick it
//! classifies link health from the latest telemetry sample (worst of loss,
//! RTT, and jitter against role-agnostic thresholds), computes a target as a
//! fraction of the role's baseline, and applies it to the live sender, with
//! hysteresis so noise-level fluctuations never churn the encoder.

use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, warn};

use duocast_core::config::QualityConfig;
use duocast_core::models::{
    ClientRole, LatencyProfile, LinkHealth, StreamStats, ViewerCapabilities,
};

use crate::transport::{EncodingTarget, PeerTransport};

/// Hard floors applied to whatever target the tiers produce.
const MIN_APPLY_BITRATE: u32 = 250_000;
const MIN_APPLY_FPS: u32 = 10;

/// Downscale divisors per (role, tier). The controller stays sharper because
/// it optimizes for responsiveness; the viewer trades resolution for
/// smoothness under pressure.
const CONTROLLER_SCALE_POOR: f64 = 1.5;
const CONTROLLER_SCALE_FAIR: f64 = 1.25;
const VIEWER_SCALE_POOR: f64 = 1.75;
const VIEWER_SCALE_FAIR: f64 = 1.5;

/// Smallest viewer dimensions worth resizing the host display for.
const MIN_RESIZE_WIDTH: u32 = 320;
const MIN_RESIZE_HEIGHT: u32 = 240;

/// Per-role encoding baseline for a latency profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleBaseline {
    pub max_bitrate: u32,
    pub min_bitrate: u32,
    pub max_fps: u32,
    pub min_fps: u32,
}

/// Baseline for a role under the selected latency profile. The controller
/// role favors responsiveness (lower bitrate ceiling, higher minimum frame
/// rate); the viewer favors fidelity.
#[must_use]
pub fn role_baseline(role: ClientRole, profile: LatencyProfile) -> RoleBaseline {
    match (profile, role) {
        (LatencyProfile::LowLatency, ClientRole::Controller) => RoleBaseline {
            max_bitrate: 4_500_000,
            min_bitrate: 1_200_000,
            max_fps: 60,
            min_fps: 30,
        },
        (LatencyProfile::LowLatency, ClientRole::Viewer) => RoleBaseline {
            max_bitrate: 7_000_000,
            min_bitrate: 1_800_000,
            max_fps: 50,
            min_fps: 24,
        },
        (LatencyProfile::Balanced, ClientRole::Controller) => RoleBaseline {
            max_bitrate: 6_000_000,
            min_bitrate: 1_500_000,
            max_fps: 60,
            min_fps: 30,
        },
        (LatencyProfile::Balanced, ClientRole::Viewer) => RoleBaseline {
            max_bitrate: 10_000_000,
            min_bitrate: 2_000_000,
            max_fps: 60,
            min_fps: 24,
        },
    }
}

/// External display-configuration capability. Failures degrade the core
/// gracefully and never abort a negotiation.
#[async_trait]
pub trait DisplayControl: Send + Sync {
    async fn resize_display(&self, width: u32, height: u32) -> anyhow::Result<()>;
}

/// Adaptive quality controller for one role.
pub struct QualityController {
    role: ClientRole,
    profile: LatencyProfile,
    config: QualityConfig,
    health: LinkHealth,
    last_applied: Option<EncodingTarget>,
    last_resize: Option<Instant>,
}

impl QualityController {
    #[must_use]
    pub fn new(role: ClientRole, profile: LatencyProfile, config: QualityConfig) -> Self {
        Self {
            role,
            profile,
            config,
            health: LinkHealth::Unknown,
            last_applied: None,
            last_resize: None,
        }
    }

    #[must_use]
    pub fn health(&self) -> LinkHealth {
        self.health
    }

    #[must_use]
    pub fn role(&self) -> ClientRole {
        self.role
    }

    pub fn set_profile(&mut self, profile: LatencyProfile) {
        if self.profile != profile {
            self.profile = profile;
            // Force the next tick to re-apply against the new baseline.
            self.last_applied = None;
        }
    }

    /// Classify link health from one sample: the worst of the three signals
    /// wins.
    #[must_use]
    pub fn classify(&self, stats: &StreamStats) -> LinkHealth {
        let loss = stats.packet_loss.clamp(0.0, 1.0);
        let q = &self.config;

        if loss > q.poor_loss || stats.rtt > q.poor_rtt_ms || stats.jitter > q.poor_jitter_ms {
            LinkHealth::Poor
        } else if loss > q.fair_loss || stats.rtt > q.fair_rtt_ms || stats.jitter > q.fair_jitter_ms
        {
            LinkHealth::Fair
        } else {
            LinkHealth::Good
        }
    }

    /// Target for a health tier, as a fraction of the role baseline.
    #[must_use]
    pub fn target_for(&self, health: LinkHealth) -> EncodingTarget {
        let base = role_baseline(self.role, self.profile);
        let q = &self.config;

        let (mut bitrate, mut fps, scale) = match health {
            LinkHealth::Poor => (
                (base.max_bitrate as f64 * q.poor_bitrate_fraction) as u32,
                (base.max_fps as f64 * q.poor_fps_fraction) as u32,
                self.scale_for(LinkHealth::Poor),
            ),
            LinkHealth::Fair => (
                (base.max_bitrate as f64 * q.fair_bitrate_fraction) as u32,
                (base.max_fps as f64 * q.fair_fps_fraction) as u32,
                self.scale_for(LinkHealth::Fair),
            ),
            LinkHealth::Good | LinkHealth::Unknown => (base.max_bitrate, base.max_fps, 1.0),
        };

        bitrate = bitrate.max(base.min_bitrate);
        fps = fps.max(base.min_fps);

        // Responsiveness floor: the controller never drops below its
        // configured frame rate unless the link is outright poor.
        if self.role == ClientRole::Controller && health != LinkHealth::Poor {
            fps = fps.max(self.config.controller_fps_floor);
        }

        EncodingTarget {
            max_bitrate: bitrate.max(MIN_APPLY_BITRATE),
            max_framerate: fps.max(MIN_APPLY_FPS),
            scale_down_by: scale.max(1.0),
        }
    }

    fn scale_for(&self, health: LinkHealth) -> f64 {
        match (self.role, health) {
            (ClientRole::Controller, LinkHealth::Poor) => CONTROLLER_SCALE_POOR,
            (ClientRole::Controller, LinkHealth::Fair) => CONTROLLER_SCALE_FAIR,
            (ClientRole::Viewer, LinkHealth::Poor) => VIEWER_SCALE_POOR,
            (ClientRole::Viewer, LinkHealth::Fair) => VIEWER_SCALE_FAIR,
            _ => 1.0,
        }
    }

    /// Whether a new target differs enough from the last applied one to be
    /// worth an encoder reconfiguration.
    #[must_use]
    fn should_apply(&self, target: &EncodingTarget) -> bool {
        let Some(last) = &self.last_applied else {
            return true;
        };
        last.max_bitrate.abs_diff(target.max_bitrate) > self.config.apply_bitrate_delta
            || last.max_framerate.abs_diff(target.max_framerate) > self.config.apply_fps_delta
            || (last.scale_down_by - target.scale_down_by).abs() > self.config.apply_scale_delta
    }

    /// One adaptation tick: classify, compute, and apply if warranted.
    /// Application failures are swallowed; the next tick retries with fresh
    /// numbers.
    pub async fn tick(&mut self, transport: &dyn PeerTransport, stats: &StreamStats) -> LinkHealth {
        let health = self.classify(stats);
        if health != self.health {
            debug!(role = %self.role, old = ?self.health, new = ?health, "Link health changed");
            self.health = health;
        }

        let target = self.target_for(health);
        if !self.should_apply(&target) {
            return health;
        }

        match transport.apply_encoding_target(target).await {
            Ok(()) => {
                self.last_applied = Some(target);
            }
            Err(e) => {
                debug!(role = %self.role, error = %e, "Encoding target rejected, will retry next tick");
            }
        }

        health
    }

    /// Handle a one-shot viewer capability report: ask the display agent to
    /// match the viewer's dimensions, rate-limited so capability bursts
    /// cannot thrash the host display. Returns whether a resize was
    /// attempted.
    pub async fn on_viewer_capabilities(
        &mut self,
        caps: &ViewerCapabilities,
        display: &dyn DisplayControl,
    ) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_resize {
            if now.duration_since(last).as_millis() < u128::from(self.config.resize_min_interval_ms)
            {
                return false;
            }
        }

        let (width, height) = caps.usable();
        if width < MIN_RESIZE_WIDTH || height < MIN_RESIZE_HEIGHT {
            return false;
        }

        self.last_resize = Some(now);
        if let Err(e) = display.resize_display(width, height).await {
            warn!(width, height, error = %e, "Display agent resize failed, continuing without it");
        }
        true
    }
}
