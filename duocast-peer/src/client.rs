//! Client-side negotiation: the answering half of the handshake.
//!
//! The client waits for an offer, applies it, flushes any candidates that
//! raced ahead, answers, reports its screen capabilities once, and starts
//! telemetry. A new offer while a prior transport is live replaces it
//! cleanly: fresh ICE/DTLS, no overlap.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use duocast_core::models::{
    ClientRole, IceCandidate, ParticipantId, SessionId, SignalMessage, SignalPayload, StreamStats,
    ViewerCapabilities,
};

use crate::negotiator::NegotiationPhase;
use crate::telemetry::StatsTracker;
use crate::transport::{
    PeerTransport, SignalOutbox, TransportEvent, TransportFactory, TransportState,
};

struct Attempt {
    transport: Arc<dyn PeerTransport>,
    remote_described: bool,
    generation: u64,
    sampler: Option<JoinHandle<()>>,
}

struct ClientState {
    attempt: Option<Attempt>,
    /// Candidates that arrived before the session description was applied
    pending_candidates: Vec<IceCandidate>,
    generation: u64,
}

/// Fields shared with the event pump and sampler tasks.
struct Shared {
    client_id: ParticipantId,
    session_id: SessionId,
    outbox: Arc<dyn SignalOutbox>,
    phase_tx: watch::Sender<NegotiationPhase>,
    stats_tx: watch::Sender<Option<StreamStats>>,
    state: Mutex<ClientState>,
}

/// Answering-side negotiator for one client.
pub struct ClientNegotiator {
    role: ClientRole,
    host_signal_id: ParticipantId,
    capabilities: Option<ViewerCapabilities>,
    telemetry_interval: Duration,
    factory: Arc<dyn TransportFactory>,
    shared: Arc<Shared>,
}

impl ClientNegotiator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        client_id: ParticipantId,
        role: ClientRole,
        session_id: SessionId,
        host_signal_id: ParticipantId,
        capabilities: Option<ViewerCapabilities>,
        telemetry_interval: Duration,
        factory: Arc<dyn TransportFactory>,
        outbox: Arc<dyn SignalOutbox>,
    ) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(NegotiationPhase::Idle);
        let (stats_tx, _) = watch::channel(None);
        Arc::new(Self {
            role,
            host_signal_id,
            capabilities,
            telemetry_interval,
            factory,
            shared: Arc::new(Shared {
                client_id,
                session_id,
                outbox,
                phase_tx,
                stats_tx,
                state: Mutex::new(ClientState {
                    attempt: None,
                    pending_candidates: Vec::new(),
                    generation: 0,
                }),
            }),
        })
    }

    #[must_use]
    pub fn role(&self) -> ClientRole {
        self.role
    }

    #[must_use]
    pub fn phase_watch(&self) -> watch::Receiver<NegotiationPhase> {
        self.shared.phase_tx.subscribe()
    }

    /// Latest derived telemetry sample, updated once per second while a
    /// transport is live.
    #[must_use]
    pub fn stats_watch(&self) -> watch::Receiver<Option<StreamStats>> {
        self.shared.stats_tx.subscribe()
    }

    pub async fn phase(&self) -> NegotiationPhase {
        *self.shared.phase_tx.borrow()
    }

    /// Ask the host for a fresh negotiation (e.g. after local playback
    /// stalled beyond recovery).
    pub fn request_renegotiate(&self) {
        self.shared.outbox.send(SignalMessage {
            from: self.shared.client_id.clone(),
            to: self.host_signal_id.clone(),
            session_id: self.shared.session_id.clone(),
            payload: SignalPayload::Renegotiate,
        });
    }

    /// Process one inbound signaling message addressed to this client.
    pub async fn handle_signal(&self, message: SignalMessage) {
        match message.payload {
            SignalPayload::Offer { ref sdp } => self.handle_offer(&message.from, sdp).await,
            SignalPayload::IceCandidate(candidate) => self.handle_candidate(candidate).await,
            other => {
                debug!(client_id = %self.shared.client_id, kind = other.kind(), "Ignoring unexpected signal");
            }
        }
    }

    async fn handle_offer(&self, from: &ParticipantId, sdp: &str) {
        let shared = &self.shared;

        // Clean replace: close any live transport before building the new
        // one, and drop candidates that belonged to it.
        let (generation, prior) = {
            let mut state = shared.state.lock().await;
            state.generation += 1;
            let prior = state.attempt.take();
            if prior.is_some() {
                state.pending_candidates.clear();
            }
            (state.generation, prior)
        };
        if let Some(prior) = prior {
            if let Some(sampler) = prior.sampler {
                sampler.abort();
            }
            prior.transport.close().await;
            debug!(client_id = %shared.client_id, "Replaced live transport for new offer");
        }

        let (transport, events_rx) = match self.factory.create(self.role).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(client_id = %shared.client_id, error = %e, "Transport construction failed");
                shared.phase_tx.send_replace(NegotiationPhase::Failed);
                return;
            }
        };

        {
            let mut state = shared.state.lock().await;
            if state.generation != generation {
                drop(state);
                transport.close().await;
                return;
            }
            state.attempt = Some(Attempt {
                transport: Arc::clone(&transport),
                remote_described: false,
                generation,
                sampler: None,
            });
        }
        spawn_event_pump(Arc::clone(shared), from.clone(), generation, events_rx);
        shared.phase_tx.send_replace(NegotiationPhase::Connecting);

        if let Err(e) = transport.apply_remote_offer(sdp).await {
            warn!(client_id = %shared.client_id, error = %e, "Failed to apply remote offer");
            shared.phase_tx.send_replace(NegotiationPhase::Failed);
            return;
        }

        // Flush candidates that arrived ahead of the description, in their
        // original arrival order, exactly once.
        let pending = {
            let mut state = shared.state.lock().await;
            if let Some(attempt) = state.attempt.as_mut() {
                attempt.remote_described = true;
            }
            std::mem::take(&mut state.pending_candidates)
        };
        for candidate in pending {
            if let Err(e) = transport.add_remote_candidate(&candidate).await {
                debug!(client_id = %shared.client_id, error = %e, "Skipping invalid buffered candidate");
            }
        }

        let answer = match transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(client_id = %shared.client_id, error = %e, "Failed to create answer");
                shared.phase_tx.send_replace(NegotiationPhase::Failed);
                return;
            }
        };

        shared.outbox.send(SignalMessage {
            from: shared.client_id.clone(),
            to: from.clone(),
            session_id: shared.session_id.clone(),
            payload: SignalPayload::Answer { sdp: answer },
        });

        // One-shot capability report so the host can match the display to
        // this screen.
        if let Some(caps) = self.capabilities {
            shared.outbox.send(SignalMessage {
                from: shared.client_id.clone(),
                to: from.clone(),
                session_id: shared.session_id.clone(),
                payload: SignalPayload::ViewerCapabilities(caps),
            });
        }

        spawn_sampler(
            Arc::clone(shared),
            generation,
            self.telemetry_interval,
            transport,
        )
        .await;
        info!(client_id = %shared.client_id, role = %self.role, "Answer sent");
    }

    async fn handle_candidate(&self, candidate: IceCandidate) {
        let shared = &self.shared;
        let transport = {
            let mut state = shared.state.lock().await;
            match state.attempt.as_ref() {
                Some(attempt) if attempt.remote_described => Arc::clone(&attempt.transport),
                _ => {
                    state.pending_candidates.push(candidate);
                    return;
                }
            }
        };

        if let Err(e) = transport.add_remote_candidate(&candidate).await {
            debug!(client_id = %shared.client_id, error = %e, "Skipping invalid candidate");
        }
    }

    /// Release everything: transport, telemetry task, buffered candidates.
    /// Idempotent, reachable from any teardown trigger.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let attempt = {
            let mut state = shared.state.lock().await;
            state.generation += 1;
            state.pending_candidates.clear();
            state.attempt.take()
        };
        shared.phase_tx.send_replace(NegotiationPhase::Closed);

        if let Some(attempt) = attempt {
            if let Some(sampler) = attempt.sampler {
                sampler.abort();
            }
            attempt.transport.close().await;
        }
    }
}

/// Forward transport events: trickle local candidates back to the host, map
/// connection-state changes onto the phase watch.
fn spawn_event_pump(
    shared: Arc<Shared>,
    host_id: ParticipantId,
    generation: u64,
    mut events_rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            {
                let state = shared.state.lock().await;
                let current = state
                    .attempt
                    .as_ref()
                    .is_some_and(|a| a.generation == generation);
                if !current {
                    break;
                }
            }

            match event {
                TransportEvent::LocalCandidate(candidate) => {
                    shared.outbox.send(SignalMessage {
                        from: shared.client_id.clone(),
                        to: host_id.clone(),
                        session_id: shared.session_id.clone(),
                        payload: SignalPayload::IceCandidate(candidate),
                    });
                }
                TransportEvent::StateChange(state_change) => {
                    let phase = match state_change {
                        TransportState::Connected => Some(NegotiationPhase::Connected),
                        TransportState::Disconnected => Some(NegotiationPhase::Disconnected),
                        TransportState::Failed => Some(NegotiationPhase::Failed),
                        _ => None,
                    };
                    if let Some(phase) = phase {
                        shared.phase_tx.send_replace(phase);
                    }
                }
            }
        }
    });
}

/// Pull telemetry once per interval and publish the derived sample. The
/// transport vanishing mid-tick is tolerated; the task is aborted when its
/// attempt is replaced or shut down.
async fn spawn_sampler(
    shared: Arc<Shared>,
    generation: u64,
    interval: Duration,
    transport: Arc<dyn PeerTransport>,
) {
    let sampler_shared = Arc::clone(&shared);
    let handle = tokio::spawn(async move {
        let mut tracker = StatsTracker::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match transport.stats().await {
                Ok(raw) => {
                    let stats = tracker.sample(&raw, Instant::now());
                    sampler_shared.stats_tx.send_replace(Some(stats));
                }
                Err(_) => continue,
            }
        }
    });

    let mut state = shared.state.lock().await;
    match state.attempt.as_mut() {
        Some(attempt) if attempt.generation == generation => {
            attempt.sampler = Some(handle);
        }
        // The attempt was replaced while we were spawning.
        _ => handle.abort(),
    }
}
