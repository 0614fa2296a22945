//! HTTP client for the external display agent.
//!
//! The agent is an opaque capability that shells out to OS display
//! configuration; duocast only consumes it. Every failure here degrades to a
//! logged advisory, because an unreachable agent must never abort an
//! in-progress negotiation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use duocast_core::config::AgentConfig;
use duocast_peer::DisplayControl;

/// Display profile understood by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDisplayProfile {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
    pub dpi: u32,
    pub scale_percent: u32,
    pub monitor_id: u32,
}

impl Default for AgentDisplayProfile {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            refresh_hz: 60,
            dpi: 96,
            scale_percent: 100,
            monitor_id: 2,
        }
    }
}

/// Display status reported by the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDisplayStatus {
    pub available: bool,
    pub active: bool,
    pub provider: Option<String>,
    pub profile: Option<AgentDisplayProfile>,
    pub last_error: Option<String>,
}

/// Profile endpoint response: current profile plus whether the provider can
/// actually apply resolution/DPI changes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDisplayProfileResponse {
    pub profile: Option<AgentDisplayProfile>,
    pub configure_supported: Option<bool>,
    pub configure_reason: Option<String>,
    pub status: Option<AgentDisplayStatus>,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Display agent is not configured")]
    Disabled,

    #[error("Display agent request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Display agent returned an error: {0}")]
    Agent(String),
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Client for the display agent HTTP API.
pub struct DisplayAgentClient {
    base_url: String,
    http: reqwest::Client,
}

impl DisplayAgentClient {
    /// Build a client when an agent endpoint is configured.
    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Option<Self> {
        let base_url = config.base_url.as_ref()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> AgentResult<T> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AgentError::Agent(format!("{} on {path}", response.status())));
        }
        Ok(response.json().await?)
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> AgentResult<T> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AgentError::Agent(format!("{} on {path}", response.status())));
        }
        Ok(response.json().await?)
    }

    /// Bring the virtual display up in the given mode (e.g. `extend`).
    pub async fn ensure_display(&self, mode: &str) -> AgentResult<AgentDisplayStatus> {
        self.post("/display/ensure", json!({ "mode": mode })).await
    }

    /// Return the display to its internal mode.
    pub async fn release_display(&self) -> AgentResult<AgentDisplayStatus> {
        self.post("/display/release", json!({})).await
    }

    /// Re-detect monitors and modes on the provider.
    pub async fn probe_display(&self) -> AgentResult<AgentDisplayStatus> {
        self.post("/display/probe", json!({})).await
    }

    pub async fn display_status(&self) -> AgentResult<AgentDisplayStatus> {
        self.get("/display/status").await
    }

    pub async fn get_display_profile(&self) -> AgentResult<AgentDisplayProfileResponse> {
        self.get("/display/profile").await
    }

    /// Save a display profile, optionally applying it immediately.
    pub async fn set_display_profile(
        &self,
        profile: &AgentDisplayProfile,
        apply_now: bool,
    ) -> AgentResult<AgentDisplayProfileResponse> {
        self.post(
            "/display/profile",
            json!({ "profile": profile, "applyNow": apply_now }),
        )
        .await
    }
}

#[async_trait]
impl DisplayControl for DisplayAgentClient {
    /// Resize the virtual display to the viewer's dimensions. The current
    /// profile is fetched first so only the resolution changes; any failure
    /// is surfaced as an advisory to the caller.
    async fn resize_display(&self, width: u32, height: u32) -> anyhow::Result<()> {
        let current = match self.get_display_profile().await {
            Ok(response) => {
                if response.configure_supported == Some(false) {
                    debug!(
                        reason = response.configure_reason.as_deref().unwrap_or("unspecified"),
                        "Display provider cannot apply resolution changes"
                    );
                    return Ok(());
                }
                response.profile.unwrap_or_default()
            }
            Err(e) => {
                warn!(error = %e, "Could not read display profile before resize");
                AgentDisplayProfile::default()
            }
        };

        let profile = AgentDisplayProfile {
            width,
            height,
            ..current
        };
        self.set_display_profile(&profile, true).await?;
        Ok(())
    }
}
