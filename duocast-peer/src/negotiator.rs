//! Host-side negotiation state machine, one instance per client role.
//!
//! Each negotiator drives offer/answer/candidate exchange for exactly one
//! remote participant at a time. The two role instances share no mutable
//! state: a failure or reconnection cycle on one side never touches the
//! other. Out-of-order protocol messages are rejected by state guards, not
//! by locking.

use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use duocast_core::models::{
    ClientRole, IceCandidate, ParticipantId, SessionId, SignalMessage, SignalPayload,
};

use crate::transport::{
    PeerTransport, SignalOutbox, TransportEvent, TransportFactory, TransportState,
};

/// Negotiation lifecycle per (side, role) pair.
///
/// `OfferSent` is the signaling guard within the connecting phase: an answer
/// is accepted only there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationPhase {
    #[default]
    Idle,
    /// Offer transmitted, awaiting the remote answer
    OfferSent,
    /// Answer applied, transport-level connectivity in progress
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Phase change notification delivered to the engine
#[derive(Debug, Clone)]
pub struct NegotiatorEvent {
    pub role: ClientRole,
    pub remote_id: ParticipantId,
    pub phase: NegotiationPhase,
}

struct Attempt {
    remote_id: ParticipantId,
    transport: Arc<dyn PeerTransport>,
    /// Remote candidates that raced ahead of the answer, in arrival order
    pending_candidates: Vec<IceCandidate>,
    answer_applied: bool,
    generation: u64,
}

struct NegotiatorState {
    phase: NegotiationPhase,
    attempt: Option<Attempt>,
    generation: u64,
}

/// Fields shared with the transport event pump tasks.
struct Shared {
    role: ClientRole,
    host_signal_id: ParticipantId,
    session_id: SessionId,
    outbox: Arc<dyn SignalOutbox>,
    events_tx: mpsc::UnboundedSender<NegotiatorEvent>,
    phase_tx: watch::Sender<NegotiationPhase>,
    state: Mutex<NegotiatorState>,
}

impl Shared {
    async fn set_phase(&self, remote_id: &ParticipantId, phase: NegotiationPhase) {
        {
            let mut state = self.state.lock().await;
            state.phase = phase;
        }
        self.phase_tx.send_replace(phase);
        let _ = self.events_tx.send(NegotiatorEvent {
            role: self.role,
            remote_id: remote_id.clone(),
            phase,
        });
    }
}

/// Host-side negotiator for one client role.
pub struct HostNegotiator {
    shared: Arc<Shared>,
    factory: Arc<dyn TransportFactory>,
}

impl HostNegotiator {
    #[must_use]
    pub fn new(
        role: ClientRole,
        host_signal_id: ParticipantId,
        session_id: SessionId,
        factory: Arc<dyn TransportFactory>,
        outbox: Arc<dyn SignalOutbox>,
        events_tx: mpsc::UnboundedSender<NegotiatorEvent>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(NegotiationPhase::Idle);
        Self {
            shared: Arc::new(Shared {
                role,
                host_signal_id,
                session_id,
                outbox,
                events_tx,
                phase_tx,
                state: Mutex::new(NegotiatorState {
                    phase: NegotiationPhase::Idle,
                    attempt: None,
                    generation: 0,
                }),
            }),
            factory,
        }
    }

    #[must_use]
    pub fn role(&self) -> ClientRole {
        self.shared.role
    }

    /// Watch phase transitions for this role.
    #[must_use]
    pub fn phase_watch(&self) -> watch::Receiver<NegotiationPhase> {
        self.shared.phase_tx.subscribe()
    }

    pub async fn phase(&self) -> NegotiationPhase {
        self.shared.state.lock().await.phase
    }

    pub async fn remote_id(&self) -> Option<ParticipantId> {
        self.shared
            .state
            .lock()
            .await
            .attempt
            .as_ref()
            .map(|a| a.remote_id.clone())
    }

    /// Whether this negotiator would currently accept an answer.
    pub async fn is_awaiting_answer(&self) -> bool {
        self.shared.state.lock().await.phase == NegotiationPhase::OfferSent
    }

    /// Live transport of the current attempt, if any.
    pub async fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.shared
            .state
            .lock()
            .await
            .attempt
            .as_ref()
            .map(|a| Arc::clone(&a.transport))
    }

    /// Originate a fresh negotiation toward `remote_id`: build a new
    /// transport, attach media (and the input side-channel for the
    /// controller role), create an offer, and transmit it through the relay.
    ///
    /// Any prior transport for this role is closed first; a retry always
    /// starts from clean ICE/DTLS state. Returns whether the offer went out.
    pub async fn begin_offer(&self, remote_id: ParticipantId) -> bool {
        let shared = &self.shared;

        let (generation, prior) = {
            let mut state = shared.state.lock().await;
            state.generation += 1;
            (state.generation, state.attempt.take())
        };
        if let Some(prior) = prior {
            debug!(role = %shared.role, remote = %prior.remote_id, "Replacing live transport for new offer");
            prior.transport.close().await;
        }

        let (transport, events_rx) = match self.factory.create(shared.role).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(role = %shared.role, remote = %remote_id, error = %e, "Transport construction failed");
                shared.set_phase(&remote_id, NegotiationPhase::Failed).await;
                return false;
            }
        };

        {
            let mut state = shared.state.lock().await;
            if state.generation != generation {
                // Another origination raced us; ours is stale.
                drop(state);
                transport.close().await;
                return false;
            }
            state.attempt = Some(Attempt {
                remote_id: remote_id.clone(),
                transport: Arc::clone(&transport),
                pending_candidates: Vec::new(),
                answer_applied: false,
                generation,
            });
        }

        spawn_event_pump(Arc::clone(shared), remote_id.clone(), generation, events_rx);

        let sdp = match transport.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!(role = %shared.role, remote = %remote_id, error = %e, "Offer creation failed");
                shared.set_phase(&remote_id, NegotiationPhase::Failed).await;
                return false;
            }
        };

        shared.outbox.send(SignalMessage {
            from: shared.host_signal_id.clone(),
            to: remote_id.clone(),
            session_id: shared.session_id.clone(),
            payload: SignalPayload::Offer { sdp },
        });

        shared.set_phase(&remote_id, NegotiationPhase::OfferSent).await;
        info!(role = %shared.role, remote = %remote_id, "Offer sent");
        true
    }

    /// Apply a remote answer. Accepted only while awaiting one; an answer in
    /// any other phase is discarded (non-fatal).
    pub async fn handle_answer(&self, from: &ParticipantId, sdp: &str) {
        let shared = &self.shared;

        let (transport, remote_id) = {
            let state = shared.state.lock().await;
            if state.phase != NegotiationPhase::OfferSent {
                debug!(
                    role = %shared.role,
                    from = %from,
                    phase = ?state.phase,
                    "Discarding answer outside offer-sent phase"
                );
                return;
            }
            match state.attempt.as_ref() {
                Some(a) => (Arc::clone(&a.transport), a.remote_id.clone()),
                None => return,
            }
        };

        if let Err(e) = transport.apply_answer(sdp).await {
            warn!(role = %shared.role, remote = %remote_id, error = %e, "Failed to apply answer");
            shared.set_phase(&remote_id, NegotiationPhase::Failed).await;
            return;
        }

        // Flush candidates that arrived ahead of the answer, in arrival
        // order, exactly once.
        let pending = {
            let mut state = shared.state.lock().await;
            match state.attempt.as_mut() {
                Some(a) => {
                    a.answer_applied = true;
                    std::mem::take(&mut a.pending_candidates)
                }
                None => Vec::new(),
            }
        };
        for candidate in pending {
            if let Err(e) = transport.add_remote_candidate(&candidate).await {
                debug!(role = %shared.role, error = %e, "Skipping invalid buffered candidate");
            }
        }

        shared.set_phase(&remote_id, NegotiationPhase::Connecting).await;
        debug!(role = %shared.role, remote = %remote_id, "Answer applied");
    }

    /// Apply or buffer a remote candidate, depending on whether the remote
    /// description is in place yet.
    pub async fn handle_candidate(&self, candidate: IceCandidate) {
        let shared = &self.shared;
        let transport = {
            let mut state = shared.state.lock().await;
            match state.attempt.as_mut() {
                Some(a) if !a.answer_applied => {
                    a.pending_candidates.push(candidate);
                    return;
                }
                Some(a) => Arc::clone(&a.transport),
                None => {
                    debug!(role = %shared.role, "Dropping candidate with no negotiation in progress");
                    return;
                }
            }
        };

        if let Err(e) = transport.add_remote_candidate(&candidate).await {
            debug!(role = %shared.role, error = %e, "Skipping invalid candidate");
        }
    }

    /// Release the current attempt: close the transport (side-channel and
    /// tracks included) and discard buffered candidates. Idempotent.
    pub async fn teardown(&self) {
        let shared = &self.shared;
        let attempt = {
            let mut state = shared.state.lock().await;
            state.generation += 1;
            state.phase = NegotiationPhase::Closed;
            state.attempt.take()
        };
        shared.phase_tx.send_replace(NegotiationPhase::Closed);

        if let Some(attempt) = attempt {
            attempt.transport.close().await;
            debug!(role = %shared.role, remote = %attempt.remote_id, "Negotiation torn down");
        }
    }
}

/// Forward transport events for one attempt: trickle local candidates out,
/// map connection-state changes onto the negotiation phase. Events from a
/// replaced (stale) attempt are dropped.
fn spawn_event_pump(
    shared: Arc<Shared>,
    remote_id: ParticipantId,
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
                        from: shared.host_signal_id.clone(),
                        to: remote_id.clone(),
                        session_id: shared.session_id.clone(),
                        payload: SignalPayload::IceCandidate(candidate),
                    });
                }
                TransportEvent::StateChange(state_change) => {
                    let phase = match state_change {
                        TransportState::Connected => Some(NegotiationPhase::Connected),
                        TransportState::Disconnected => Some(NegotiationPhase::Disconnected),
                        TransportState::Failed => Some(NegotiationPhase::Failed),
                        TransportState::New
                        | TransportState::Connecting
                        | TransportState::Closed => None,
                    };
                    if let Some(phase) = phase {
                        shared.set_phase(&remote_id, phase).await;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CapturingOutbox, MockFactory};
    use tokio::task::yield_now;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    struct Fixture {
        negotiator: HostNegotiator,
        factory: Arc<MockFactory>,
        outbox: Arc<CapturingOutbox>,
        events_rx: mpsc::UnboundedReceiver<NegotiatorEvent>,
    }

    fn fixture(role: ClientRole) -> Fixture {
        let factory = Arc::new(MockFactory::new());
        let outbox = Arc::new(CapturingOutbox::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let negotiator = HostNegotiator::new(
            role,
            ParticipantId::from("host-h1"),
            SessionId::from("s1"),
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            Arc::clone(&outbox) as Arc<dyn SignalOutbox>,
            events_tx,
        );
        Fixture {
            negotiator,
            factory,
            outbox,
            events_rx,
        }
    }

    #[tokio::test]
    async fn test_begin_offer_sends_offer_and_awaits_answer() {
        let f = fixture(ClientRole::Controller);
        assert!(f.negotiator.begin_offer(ParticipantId::from("c1")).await);

        assert!(f.negotiator.is_awaiting_answer().await);
        let sent = f.outbox.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, ParticipantId::from("c1"));
        assert!(matches!(sent[0].payload, SignalPayload::Offer { .. }));
    }

    #[tokio::test]
    async fn test_answer_outside_offer_sent_is_discarded() {
        let f = fixture(ClientRole::Controller);
        // No offer in flight: the answer must be ignored without fault.
        f.negotiator
            .handle_answer(&ParticipantId::from("c1"), "v=0 answer")
            .await;
        assert_eq!(f.negotiator.phase().await, NegotiationPhase::Idle);

        f.negotiator.begin_offer(ParticipantId::from("c1")).await;
        f.negotiator
            .handle_answer(&ParticipantId::from("c1"), "v=0 answer")
            .await;
        assert_eq!(f.negotiator.phase().await, NegotiationPhase::Connecting);

        // A duplicate answer after the first is discarded.
        f.negotiator
            .handle_answer(&ParticipantId::from("c1"), "v=0 duplicate")
            .await;
        let transport = f.factory.transports()[0].clone();
        assert_eq!(transport.applied_answers().len(), 1);
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_answer_then_flushed_in_order() {
        let f = fixture(ClientRole::Viewer);
        f.negotiator.begin_offer(ParticipantId::from("c2")).await;

        f.negotiator.handle_candidate(candidate(1)).await;
        f.negotiator.handle_candidate(candidate(2)).await;

        let transport = f.factory.transports()[0].clone();
        assert!(transport.added_candidates().is_empty());

        f.negotiator
            .handle_answer(&ParticipantId::from("c2"), "v=0 answer")
            .await;

        let flushed = transport.added_candidates();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].candidate, "candidate:1");
        assert_eq!(flushed[1].candidate, "candidate:2");

        // Candidates after the flush apply directly, no duplicates.
        f.negotiator.handle_candidate(candidate(3)).await;
        assert_eq!(transport.added_candidates().len(), 3);
    }

    #[tokio::test]
    async fn test_connection_events_drive_phase() {
        let mut f = fixture(ClientRole::Controller);
        f.negotiator.begin_offer(ParticipantId::from("c1")).await;
        f.negotiator
            .handle_answer(&ParticipantId::from("c1"), "v=0 answer")
            .await;

        let transport = f.factory.transports()[0].clone();
        transport.emit_state(TransportState::Connected);
        yield_now().await;

        // Drain events until the connected notification arrives.
        let mut connected = false;
        while let Ok(event) = f.events_rx.try_recv() {
            if event.phase == NegotiationPhase::Connected {
                assert_eq!(event.remote_id, ParticipantId::from("c1"));
                connected = true;
            }
        }
        assert!(connected);
        assert_eq!(f.negotiator.phase().await, NegotiationPhase::Connected);
    }

    #[tokio::test]
    async fn test_new_offer_replaces_prior_transport() {
        let f = fixture(ClientRole::Controller);
        f.negotiator.begin_offer(ParticipantId::from("c1")).await;
        f.negotiator.begin_offer(ParticipantId::from("c1")).await;

        let transports = f.factory.transports();
        assert_eq!(transports.len(), 2);
        assert!(transports[0].is_closed());
        assert!(!transports[1].is_closed());
    }

    #[tokio::test]
    async fn test_stale_transport_events_are_ignored() {
        let f = fixture(ClientRole::Controller);
        f.negotiator.begin_offer(ParticipantId::from("c1")).await;
        let first = f.factory.transports()[0].clone();

        f.negotiator.begin_offer(ParticipantId::from("c1")).await;
        first.emit_state(TransportState::Failed);
        yield_now().await;

        // The replacement offer is still awaiting its answer; the stale
        // failure must not clobber it.
        assert_eq!(f.negotiator.phase().await, NegotiationPhase::OfferSent);
    }

    #[tokio::test]
    async fn test_teardown_closes_and_discards_buffers() {
        let f = fixture(ClientRole::Viewer);
        f.negotiator.begin_offer(ParticipantId::from("c2")).await;
        f.negotiator.handle_candidate(candidate(1)).await;

        f.negotiator.teardown().await;
        let transport = f.factory.transports()[0].clone();
        assert!(transport.is_closed());
        assert_eq!(f.negotiator.phase().await, NegotiationPhase::Closed);
        assert!(f.negotiator.remote_id().await.is_none());

        // Idempotent.
        f.negotiator.teardown().await;
    }

    #[tokio::test]
    async fn test_local_candidates_trickle_to_remote() {
        let f = fixture(ClientRole::Controller);
        f.negotiator.begin_offer(ParticipantId::from("c1")).await;

        let transport = f.factory.transports()[0].clone();
        transport.emit_local_candidate(candidate(7));
        yield_now().await;

        let sent = f.outbox.messages();
        let trickled: Vec<_> = sent
            .iter()
            .filter(|m| matches!(m.payload, SignalPayload::IceCandidate(_)))
            .collect();
        assert_eq!(trickled.len(), 1);
        assert_eq!(trickled[0].to, ParticipantId::from("c1"));
    }

    #[tokio::test]
    async fn test_factory_failure_marks_failed() {
        let f = fixture(ClientRole::Controller);
        f.factory.fail_next();
        assert!(!f.negotiator.begin_offer(ParticipantId::from("c1")).await);
        assert_eq!(f.negotiator.phase().await, NegotiationPhase::Failed);
    }
}
