//! Transport seam between negotiation logic and the WebRTC stack.
//!
//! Negotiators only ever talk to [`PeerTransport`]; the production
//! implementation lives in [`crate::rtc`]. Each negotiation attempt gets a
//! brand-new transport from a [`TransportFactory`], so retries never reuse
//! stale ICE or DTLS state.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use duocast_core::models::{ClientRole, IceCandidate, SignalMessage};
use duocast_core::SignalHub;

/// Transport-level failure. Recorded as a per-role status, never propagated
/// as a process fault.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("SDP exchange failed: {0}")]
    Sdp(String),

    #[error("Candidate exchange failed: {0}")]
    Candidate(String),

    #[error("Side-channel failure: {0}")]
    Channel(String),

    #[error("Stats unavailable: {0}")]
    Stats(String),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Connection state reported by the underlying transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Event emitted by a live transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A locally discovered network candidate, to be trickled to the remote
    /// side as found
    LocalCandidate(IceCandidate),
    StateChange(TransportState),
}

/// Outbound encoding target applied to the live sender
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodingTarget {
    /// Maximum bitrate in bits per second
    pub max_bitrate: u32,
    pub max_framerate: u32,
    /// Resolution downscale divisor; 1.0 = native
    pub scale_down_by: f64,
}

/// Raw counters pulled from the transport once per second. Interval deltas
/// and derived metrics are computed by [`crate::telemetry::StatsTracker`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub packets_lost: i64,
    /// Round-trip time in milliseconds, when the remote has reported one
    pub round_trip_ms: Option<f64>,
    pub frames_per_second: Option<f64>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
}

/// One peer-to-peer media transport.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create a local offer and install it as the local description.
    async fn create_offer(&self) -> Result<String>;

    /// Apply the remote answer to a previously created offer.
    async fn apply_answer(&self, sdp: &str) -> Result<()>;

    /// Apply a remote offer (answering side).
    async fn apply_remote_offer(&self, sdp: &str) -> Result<()>;

    /// Create a local answer and install it as the local description.
    async fn create_answer(&self) -> Result<String>;

    /// Apply one remote candidate. Requires the remote description to be set.
    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Apply a new outbound encoding target to the live sender.
    async fn apply_encoding_target(&self, target: EncodingTarget) -> Result<()>;

    /// Pull raw telemetry counters.
    async fn stats(&self) -> Result<TransportStats>;

    /// Release the transport: side-channel, tracks, ICE. Idempotent.
    async fn close(&self);
}

/// Builds a fresh transport per negotiation attempt. The role decides the
/// extras: the controller role gets the ordered reliable `input` side-channel.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        role: ClientRole,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>)>;
}

/// Outbound signaling seam. Production sends through the in-process
/// [`SignalHub`]; tests capture messages instead.
pub trait SignalOutbox: Send + Sync {
    fn send(&self, message: SignalMessage);
}

impl SignalOutbox for SignalHub {
    fn send(&self, message: SignalMessage) {
        // Zero listeners means the message is dropped, by contract.
        let _ = SignalHub::send(self, message);
    }
}
