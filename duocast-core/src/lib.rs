//! Duocast core: session and signaling coordination
//!
//! One host streams its screen to at most two clients over WebRTC: the first
//! joiner becomes the `controller` (drives remote input), the second becomes a
//! passive `viewer`. This crate owns the in-process coordination layer:
//!
//! - **[`SessionRegistry`]**: the single active session, its roster, and locks
//! - **[`SignalHub`]**: per-participant push channels for signaling delivery
//! - Domain models (session, roster, signaling payloads, stream telemetry)
//! - Configuration, error taxonomy, and logging bootstrap
//!
//! Peer negotiation and adaptive quality live in `duocast-peer`; the HTTP
//! surface lives in `duocast-api`.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod registry;
pub mod relay;

pub use config::Config;
pub use error::{Error, Result};
pub use registry::{JoinOutcome, RemoveOutcome, SessionRegistry};
pub use relay::{SignalHub, SignalSubscription};
