//! Duocast HTTP surface.
//!
//! Session control (`POST`/`GET /session`), signaling submission
//! (`POST /signal`), the long-lived per-participant SSE push channel
//! (`GET /signal?listenerId=`), health probes, and the HTTP client for the
//! external display agent.

pub mod agent;
pub mod http;

pub use agent::DisplayAgentClient;
pub use http::{create_router, AppState};
