//! Server lifecycle management
//!
//! Starts the HTTP coordinator and, when enabled, the host runtime that
//! spawns one host engine per session.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use duocast_api::DisplayAgentClient;
use duocast_core::models::SessionId;
use duocast_core::{Config, SessionRegistry};
use duocast_peer::{DisplayControl, HostEngine, RtcTransportFactory, TransportFactory};

/// Keeps a host engine alive for whichever session is currently active.
///
/// The registry replaces the session wholesale on every `create`; the
/// runtime follows by retiring the old engine and spawning a fresh one.
pub struct HostRuntime;

impl HostRuntime {
    pub fn spawn(
        registry: Arc<SessionRegistry>,
        factory: Arc<dyn TransportFactory>,
        display: Option<Arc<dyn DisplayControl>>,
        config: Config,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut roster_rx = registry.roster_watch();
            let mut engine: Option<(SessionId, Arc<HostEngine>)> = None;

            loop {
                let session_id = roster_rx.borrow_and_update().session_id.clone();

                let stale = match (&engine, &session_id) {
                    (Some((current, _)), Some(new_id)) => current != new_id,
                    (Some(_), None) => true,
                    _ => false,
                };
                if stale {
                    if let Some((_, old)) = engine.take() {
                        old.shutdown().await;
                    }
                }

                if engine.is_none() && session_id.is_some() {
                    if let Some(session) = registry.current() {
                        let spawned = HostEngine::spawn(
                            &session,
                            Arc::clone(&registry),
                            Arc::clone(&factory),
                            display.clone(),
                            config.peer.clone(),
                            config.quality.clone(),
                            config.host.clone(),
                        );
                        engine = Some((session.id, spawned));
                    }
                }

                if roster_rx.changed().await.is_err() {
                    break;
                }
            }

            if let Some((_, old)) = engine.take() {
                old.shutdown().await;
            }
        })
    }
}

/// Serve the HTTP coordinator until a shutdown signal arrives.
pub async fn run(config: &Config, registry: Arc<SessionRegistry>) -> anyhow::Result<()> {
    let agent = DisplayAgentClient::from_config(&config.agent).map(Arc::new);

    let _host_runtime = if config.host.enabled {
        let factory: Arc<dyn TransportFactory> =
            Arc::new(RtcTransportFactory::new(config.ice.clone()));
        let display = agent
            .clone()
            .map(|client| client as Arc<dyn DisplayControl>);
        info!("Host engine enabled for this process");
        Some(HostRuntime::spawn(
            Arc::clone(&registry),
            factory,
            display,
            config.clone(),
        ))
    } else {
        None
    };

    let router = duocast_api::create_router(registry);

    let addr = format!("{}:{}", config.server.host, config.server.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
