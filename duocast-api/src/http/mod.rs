// Module: http
// HTTP/JSON API for session control and signaling

pub mod error;
pub mod health;
pub mod session;
pub mod signal;

use axum::{routing::post, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use duocast_core::{SessionRegistry, SignalHub};

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub hub: SignalHub,
}

/// Create the HTTP router with all routes
pub fn create_router(registry: Arc<SessionRegistry>) -> Router {
    let hub = registry.hub().clone();
    let state = AppState { registry, hub };

    let router = Router::new()
        // Health check endpoints (for monitoring probes)
        .merge(health::create_health_router())
        // Session control
        .route(
            "/session",
            post(session::session_action).get(session::session_status),
        )
        // Signaling: submission plus the per-participant push channel
        .route(
            "/signal",
            post(signal::submit_signal).get(signal::signal_stream),
        );

    // Apply layers before state
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Apply state to all routes (must be last)
    router.with_state(state)
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    let hub = SignalHub::new();
    let registry = Arc::new(SessionRegistry::new(hub.clone()));
    AppState { registry, hub }
}
