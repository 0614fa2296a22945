//! Duocast peer layer: transport negotiation and adaptive quality
//!
//! This crate drives the WebRTC side of a duocast session:
//!
//! - **[`PeerTransport`]** / **[`TransportFactory`]**: the seam between
//!   negotiation logic and the `webrtc` stack, with an in-memory mock on the
//!   test side and [`RtcTransportFactory`] in production
//! - **[`HostNegotiator`]**: per-role host-side state machine for offer
//!   origination, answer guards, candidate buffering, and reconnection
//! - **[`ClientNegotiator`]**: the answering side, with clean transport
//!   replacement on re-offer, buffered candidate flush, telemetry reporting
//! - **[`QualityController`]**: link-health classification and per-role
//!   adaptive encoding targets from live telemetry
//! - **[`HostEngine`]**: ties roster observation, both negotiators, telemetry
//!   sampling, and teardown together for the host process
//!
//! The two per-role negotiators share no mutable state; a failure or
//! reconnection cycle in one never affects the other.

pub mod client;
pub mod host;
pub mod negotiator;
pub mod quality;
pub mod rtc;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::ClientNegotiator;
pub use host::{HostEngine, StreamState};
pub use negotiator::{HostNegotiator, NegotiationPhase, NegotiatorEvent};
pub use quality::{role_baseline, DisplayControl, QualityController, RoleBaseline};
pub use rtc::{RtcTransport, RtcTransportFactory};
pub use telemetry::StatsTracker;
pub use transport::{
    EncodingTarget, PeerTransport, SignalOutbox, TransportError, TransportEvent, TransportFactory,
    TransportState, TransportStats,
};
