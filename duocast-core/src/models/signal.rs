//! Signaling messages exchanged through the relay.
//!
//! The payload is a closed tagged union: anything that does not deserialize
//! into one of the five variants is rejected at the relay boundary and never
//! reaches a negotiator. Messages are ephemeral and delivered at most once to
//! listeners subscribed under the `to` id at send time.

use serde::{Deserialize, Serialize};

use super::id::{ParticipantId, SessionId};

/// One discovered network path endpoint, forwarded individually as found
/// (trickle disclosure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Screen dimensions reported once by the viewer after connecting; may drive
/// a virtual-display resize on the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerCapabilities {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub avail_width: u32,
    #[serde(default)]
    pub avail_height: u32,
    #[serde(default = "default_pixel_ratio")]
    pub device_pixel_ratio: f64,
}

fn default_pixel_ratio() -> f64 {
    1.0
}

impl ViewerCapabilities {
    /// Usable dimensions: available area when reported, full screen otherwise.
    #[must_use]
    pub fn usable(&self) -> (u32, u32) {
        let w = if self.avail_width > 0 { self.avail_width } else { self.width };
        let h = if self.avail_height > 0 { self.avail_height } else { self.height };
        (w, h)
    }
}

/// Closed union of signaling payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate(IceCandidate),
    ViewerCapabilities(ViewerCapabilities),
    Renegotiate,
}

impl SignalPayload {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::ViewerCapabilities(_) => "viewer-capabilities",
            Self::Renegotiate => "renegotiate",
        }
    }
}

/// An addressed signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub session_id: SessionId,
    #[serde(flatten)]
    pub payload: SignalPayload,
}
