//! Host engine: roster observation, dual-role negotiation, telemetry, and
//! teardown for one session.
//!
//! The engine owns one [`HostNegotiator`] per role. The two instances are
//! fully isolated (separately keyed candidate buffers and cooldowns, no
//! shared mutable state), so a reconnection cycle on one role never disturbs
//! the other. Resource release is a single idempotent [`HostEngine::shutdown`]
//! reachable from every teardown trigger: explicit stop, session destroyed,
//! or the media source ending.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use duocast_core::config::{HostConfig, PeerConfig, QualityConfig};
use duocast_core::models::stats::STATS_HISTORY_LEN;
use duocast_core::models::{
    ClientRole, ParticipantId, RosterSnapshot, Session, SessionId, SignalMessage, SignalPayload,
    StreamStats,
};
use duocast_core::{SessionRegistry, SignalHub};

use crate::negotiator::{HostNegotiator, NegotiationPhase, NegotiatorEvent};
use crate::quality::{DisplayControl, QualityController};
use crate::telemetry::StatsTracker;
use crate::transport::{SignalOutbox, TransportFactory};

/// Host stream lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Starting,
    AwaitingClients,
    Streaming,
    Degraded,
    Stopping,
}

/// One value per client role.
struct PerRole<T> {
    controller: T,
    viewer: T,
}

impl<T> PerRole<T> {
    fn get(&self, role: ClientRole) -> &T {
        match role {
            ClientRole::Controller => &self.controller,
            ClientRole::Viewer => &self.viewer,
        }
    }

    fn get_mut(&mut self, role: ClientRole) -> &mut T {
        match role {
            ClientRole::Controller => &mut self.controller,
            ClientRole::Viewer => &mut self.viewer,
        }
    }
}

const ROLES: [ClientRole; 2] = [ClientRole::Controller, ClientRole::Viewer];

struct EngineInner {
    /// Participants with a transport considered live (offer sent or beyond)
    connected: HashSet<ParticipantId>,
    /// Participants with an offer currently being originated. Disjoint from
    /// `connected`; together they prevent duplicate negotiation (glare).
    offer_in_flight: HashSet<ParticipantId>,
    roles: HashMap<ParticipantId, ClientRole>,
    /// Last reconnection attempt per participant
    cooldowns: HashMap<ParticipantId, Instant>,
    quality: PerRole<QualityController>,
    trackers: PerRole<StatsTracker>,
    history: PerRole<VecDeque<StreamStats>>,
}

/// A reconnection the events task should schedule.
struct Retry {
    role: ClientRole,
    remote_id: ParticipantId,
}

/// Drives the host side of one session.
pub struct HostEngine {
    session_id: SessionId,
    host_signal_id: ParticipantId,
    registry: Arc<SessionRegistry>,
    hub: SignalHub,
    display: Option<Arc<dyn DisplayControl>>,
    peer_config: PeerConfig,
    host_config: HostConfig,
    negotiators: PerRole<HostNegotiator>,
    inner: Mutex<EngineInner>,
    stream_state_tx: watch::Sender<StreamState>,
    cancel: CancellationToken,
    shutdown_done: AtomicBool,
}

impl HostEngine {
    /// Construct the engine for an active session and start its background
    /// tasks: roster reconciliation, signal dispatch, negotiator event
    /// handling, and per-role telemetry sampling.
    pub fn spawn(
        session: &Session,
        registry: Arc<SessionRegistry>,
        factory: Arc<dyn TransportFactory>,
        display: Option<Arc<dyn DisplayControl>>,
        peer_config: PeerConfig,
        quality_config: QualityConfig,
        host_config: HostConfig,
    ) -> Arc<Self> {
        let hub = registry.hub().clone();
        let outbox: Arc<dyn SignalOutbox> = Arc::new(hub.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let host_signal_id = session.host_signal_id();

        let negotiators = PerRole {
            controller: HostNegotiator::new(
                ClientRole::Controller,
                host_signal_id.clone(),
                session.id.clone(),
                Arc::clone(&factory),
                Arc::clone(&outbox),
                events_tx.clone(),
            ),
            viewer: HostNegotiator::new(
                ClientRole::Viewer,
                host_signal_id.clone(),
                session.id.clone(),
                factory,
                outbox,
                events_tx,
            ),
        };

        let profile = host_config.latency_profile;
        let (stream_state_tx, _) = watch::channel(StreamState::Starting);

        let engine = Arc::new(Self {
            session_id: session.id.clone(),
            host_signal_id,
            registry,
            hub,
            display,
            peer_config,
            host_config,
            negotiators,
            inner: Mutex::new(EngineInner {
                connected: HashSet::new(),
                offer_in_flight: HashSet::new(),
                roles: HashMap::new(),
                cooldowns: HashMap::new(),
                quality: PerRole {
                    controller: QualityController::new(
                        ClientRole::Controller,
                        profile,
                        quality_config.clone(),
                    ),
                    viewer: QualityController::new(ClientRole::Viewer, profile, quality_config),
                },
                trackers: PerRole {
                    controller: StatsTracker::new(),
                    viewer: StatsTracker::new(),
                },
                history: PerRole {
                    controller: VecDeque::new(),
                    viewer: VecDeque::new(),
                },
            }),
            stream_state_tx,
            cancel: CancellationToken::new(),
            shutdown_done: AtomicBool::new(false),
        });

        Arc::clone(&engine).spawn_roster_task();
        Arc::clone(&engine).spawn_signal_task();
        Arc::clone(&engine).spawn_events_task(events_rx);
        Arc::clone(&engine).spawn_sampler_task();

        info!(session_id = %engine.session_id, "Host engine started");
        engine
    }

    #[must_use]
    pub fn stream_state_watch(&self) -> watch::Receiver<StreamState> {
        self.stream_state_tx.subscribe()
    }

    pub async fn negotiation_phase(&self, role: ClientRole) -> NegotiationPhase {
        self.negotiators.get(role).phase().await
    }

    /// Rolling telemetry history for one role (most recent last).
    pub async fn stats_history(&self, role: ClientRole) -> Vec<StreamStats> {
        self.inner
            .lock()
            .await
            .history
            .get(role)
            .iter()
            .cloned()
            .collect()
    }

    /// Single idempotent release path: stops all timers, closes both
    /// transports, clears candidate buffers and cooldowns, and drops every
    /// signal-listener registration for every known participant.
    pub async fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stream_state_tx.send_replace(StreamState::Stopping);
        self.cancel.cancel();

        self.negotiators.controller.teardown().await;
        self.negotiators.viewer.teardown().await;

        {
            let mut inner = self.inner.lock().await;
            for id in inner.roles.keys() {
                self.hub.remove_listener(id);
            }
            self.hub.remove_listener(&self.host_signal_id);
            inner.connected.clear();
            inner.offer_in_flight.clear();
            inner.cooldowns.clear();
            inner.roles.clear();
            inner.history.controller.clear();
            inner.history.viewer.clear();
        }

        self.stream_state_tx.send_replace(StreamState::Idle);
        info!(session_id = %self.session_id, "Host engine shut down");
    }

    /// Originate a fresh offer toward `remote_id`, guarded against glare by
    /// the connected and offer-in-flight sets.
    async fn originate(&self, role: ClientRole, remote_id: ParticipantId) {
        {
            let mut inner = self.inner.lock().await;
            if inner.connected.contains(&remote_id) || inner.offer_in_flight.contains(&remote_id) {
                return;
            }
            inner.offer_in_flight.insert(remote_id.clone());
        }

        let offered = self.negotiators.get(role).begin_offer(remote_id.clone()).await;

        {
            let mut inner = self.inner.lock().await;
            inner.offer_in_flight.remove(&remote_id);
            if offered {
                inner.connected.insert(remote_id);
            }
        }
        self.refresh_stream_state().await;
    }

    async fn reconcile(&self, snapshot: RosterSnapshot) {
        if !snapshot.is_active() || snapshot.session_id.as_ref() != Some(&self.session_id) {
            info!(session_id = %self.session_id, "Session gone, tearing down host engine");
            self.shutdown().await;
            return;
        }

        let mut to_offer: Vec<(ClientRole, ParticipantId)> = Vec::new();
        let mut to_teardown: Vec<ClientRole> = Vec::new();

        {
            let mut inner = self.inner.lock().await;
            let present: HashSet<ParticipantId> =
                snapshot.clients.iter().map(|c| c.id.clone()).collect();

            for client in &snapshot.clients {
                if let Some(previous) = inner.roles.get(&client.id).copied() {
                    if previous != client.role {
                        // Promotion: the old role's transport is stale.
                        inner.connected.remove(&client.id);
                        to_teardown.push(previous);
                    }
                }
                inner.roles.insert(client.id.clone(), client.role);

                if !inner.connected.contains(&client.id)
                    && !inner.offer_in_flight.contains(&client.id)
                {
                    to_offer.push((client.role, client.id.clone()));
                }
            }

            let departed: Vec<ParticipantId> = inner
                .roles
                .keys()
                .filter(|id| !present.contains(*id))
                .cloned()
                .collect();
            for id in departed {
                if let Some(role) = inner.roles.remove(&id) {
                    to_teardown.push(role);
                }
                inner.connected.remove(&id);
                inner.offer_in_flight.remove(&id);
                inner.cooldowns.remove(&id);
            }
        }

        for role in to_teardown {
            let negotiator = self.negotiators.get(role);
            let bound = negotiator.remote_id().await;
            let still_present = {
                let inner = self.inner.lock().await;
                bound
                    .as_ref()
                    .is_some_and(|id| inner.roles.get(id) == Some(&role))
            };
            if !still_present {
                negotiator.teardown().await;
            }
        }

        for (role, id) in to_offer {
            self.originate(role, id).await;
        }

        self.refresh_stream_state().await;
    }

    async fn dispatch(&self, message: SignalMessage) {
        let from = message.from.clone();
        let role = {
            let inner = self.inner.lock().await;
            inner.roles.get(&from).copied()
        }
        .or_else(|| self.registry.client_role(&from));

        match message.payload {
            SignalPayload::Answer { sdp } => {
                let negotiator = match role {
                    Some(role) => Some(self.negotiators.get(role)),
                    // Unknown sender: fall back to whichever negotiator is
                    // awaiting an answer.
                    None => {
                        let mut found = None;
                        for role in ROLES {
                            let candidate = self.negotiators.get(role);
                            if candidate.is_awaiting_answer().await {
                                found = Some(candidate);
                                break;
                            }
                        }
                        found
                    }
                };
                let Some(negotiator) = negotiator else {
                    debug!(from = %from, "Dropping answer from unknown participant");
                    return;
                };
                if let Some(bound) = negotiator.remote_id().await {
                    if bound != from {
                        debug!(from = %from, bound = %bound, "Dropping answer from unexpected participant");
                        return;
                    }
                }
                negotiator.handle_answer(&from, &sdp).await;
            }
            SignalPayload::IceCandidate(candidate) => {
                let negotiator = match role {
                    Some(role) => Some(self.negotiators.get(role)),
                    None => {
                        let mut found = None;
                        for role in ROLES {
                            let candidate_neg = self.negotiators.get(role);
                            if candidate_neg.remote_id().await.as_ref() == Some(&from) {
                                found = Some(candidate_neg);
                                break;
                            }
                        }
                        found
                    }
                };
                if let Some(negotiator) = negotiator {
                    negotiator.handle_candidate(candidate).await;
                }
            }
            SignalPayload::ViewerCapabilities(caps) => {
                if role != Some(ClientRole::Viewer) {
                    return;
                }
                let Some(display) = self.display.as_ref().map(Arc::clone) else {
                    return;
                };
                let mut inner = self.inner.lock().await;
                inner
                    .quality
                    .get_mut(ClientRole::Viewer)
                    .on_viewer_capabilities(&caps, display.as_ref())
                    .await;
            }
            SignalPayload::Renegotiate => {
                let Some(role) = role else {
                    debug!(from = %from, "Dropping renegotiate from unknown participant");
                    return;
                };
                debug!(from = %from, role = %role, "Client requested renegotiation");
                {
                    let mut inner = self.inner.lock().await;
                    inner.connected.remove(&from);
                }
                self.originate(role, from).await;
            }
            SignalPayload::Offer { .. } => {
                debug!(from = %from, "Host ignores inbound offers");
            }
        }

        self.refresh_stream_state().await;
    }

    /// Update bookkeeping for one negotiator phase change. Returns a retry
    /// directive when a lost transport should be renegotiated.
    async fn handle_negotiator_event(&self, event: NegotiatorEvent) -> Option<Retry> {
        let retry = match event.phase {
            NegotiationPhase::Connected => {
                let mut inner = self.inner.lock().await;
                inner.cooldowns.remove(&event.remote_id);
                inner.connected.insert(event.remote_id.clone());
                None
            }
            NegotiationPhase::Disconnected | NegotiationPhase::Failed => {
                let mut inner = self.inner.lock().await;
                inner.connected.remove(&event.remote_id);

                // One retry per cooldown window, bounding retry storms.
                let now = Instant::now();
                let cooldown = Duration::from_millis(self.peer_config.reconnect_cooldown_ms);
                let recent = inner
                    .cooldowns
                    .get(&event.remote_id)
                    .is_some_and(|t| now.duration_since(*t) < cooldown);
                if recent {
                    None
                } else {
                    inner.cooldowns.insert(event.remote_id.clone(), now);
                    Some(Retry {
                        role: event.role,
                        remote_id: event.remote_id.clone(),
                    })
                }
            }
            _ => None,
        };

        self.refresh_stream_state().await;
        retry
    }

    async fn refresh_stream_state(&self) {
        if self.shutdown_done.load(Ordering::SeqCst) {
            return;
        }

        let roster_empty = self
            .registry
            .current()
            .is_none_or(|s| s.clients.is_empty());

        let mut any_connected = false;
        let mut any_trouble = false;
        for role in ROLES {
            match self.negotiators.get(role).phase().await {
                NegotiationPhase::Connected => any_connected = true,
                NegotiationPhase::Disconnected | NegotiationPhase::Failed => any_trouble = true,
                _ => {}
            }
        }

        let state = if roster_empty {
            StreamState::AwaitingClients
        } else if any_connected && !any_trouble {
            StreamState::Streaming
        } else if any_trouble {
            StreamState::Degraded
        } else {
            StreamState::AwaitingClients
        };
        self.stream_state_tx.send_replace(state);
    }

    fn spawn_roster_task(self: Arc<Self>) {
        let mut roster_rx = self.registry.roster_watch();
        tokio::spawn(async move {
            // Reconcile the roster as it stood at startup before waiting for
            // changes; clients may have joined already.
            let snapshot = roster_rx.borrow_and_update().clone();
            self.reconcile(snapshot).await;

            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    changed = roster_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = roster_rx.borrow_and_update().clone();
                        self.reconcile(snapshot).await;
                    }
                }
            }
        });
    }

    fn spawn_signal_task(self: Arc<Self>) {
        let mut subscription = self.hub.subscribe(self.host_signal_id.clone());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    message = subscription.recv() => {
                        match message {
                            Some(message) => self.dispatch(message).await,
                            None => break,
                        }
                    }
                }
            }
        });
    }

    fn spawn_events_task(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<NegotiatorEvent>) {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = self.cancel.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                if let Some(retry) = self.handle_negotiator_event(event).await {
                    let engine = Arc::clone(&self);
                    let delay = Duration::from_millis(engine.peer_config.retry_delay_ms);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if engine.cancel.is_cancelled() {
                            return;
                        }
                        // Re-check the roster at the boundary: the client may
                        // have left or changed role while we slept.
                        if engine.registry.client_role(&retry.remote_id) != Some(retry.role) {
                            return;
                        }
                        warn!(role = %retry.role, remote = %retry.remote_id, "Transport lost, negotiating a fresh one");
                        engine.originate(retry.role, retry.remote_id).await;
                    });
                }
            }
        });
    }

    fn spawn_sampler_task(self: Arc<Self>) {
        let interval = Duration::from_millis(self.peer_config.telemetry_interval_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    _ = ticker.tick() => self.sample_roles().await,
                }
            }
        });
    }

    async fn sample_roles(&self) {
        for role in ROLES {
            let negotiator = self.negotiators.get(role);
            if negotiator.phase().await != NegotiationPhase::Connected {
                continue;
            }
            let Some(transport) = negotiator.transport().await else {
                continue;
            };
            // The transport may vanish mid-tick; skip and try again next
            // second.
            let raw = match transport.stats().await {
                Ok(raw) => raw,
                Err(_) => continue,
            };

            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let stats = inner.trackers.get_mut(role).sample(&raw, Instant::now());

            let history = inner.history.get_mut(role);
            history.push_back(stats.clone());
            while history.len() > STATS_HISTORY_LEN {
                history.pop_front();
            }

            if self.host_config.auto_tune {
                inner
                    .quality
                    .get_mut(role)
                    .tick(transport.as_ref(), &stats)
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientNegotiator;
    use crate::test_support::{MockDisplay, MockFactory, MockTransport};
    use crate::transport::{TransportState, TransportStats};
    use duocast_core::config::QualityConfig;
    use duocast_core::models::ViewerCapabilities;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        registry: Arc<SessionRegistry>,
        hub: SignalHub,
        factory: Arc<MockFactory>,
        engine: Arc<HostEngine>,
        session: Session,
    }

    fn peer_config() -> PeerConfig {
        PeerConfig {
            reconnect_cooldown_ms: 50,
            retry_delay_ms: 5,
            telemetry_interval_ms: 20,
        }
    }

    fn harness(display: Option<Arc<dyn DisplayControl>>) -> Harness {
        let hub = SignalHub::new();
        let registry = Arc::new(SessionRegistry::new(hub.clone()));
        let session = registry.create_session(ParticipantId::from("h1"), None);
        let factory = Arc::new(MockFactory::new());
        let engine = HostEngine::spawn(
            &session,
            Arc::clone(&registry),
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            display,
            peer_config(),
            QualityConfig::default(),
            HostConfig {
                enabled: true,
                ..HostConfig::default()
            },
        );
        Harness {
            registry,
            hub,
            factory,
            engine,
            session,
        }
    }

    async fn wait_for_transports(factory: &MockFactory, count: usize) -> Vec<Arc<MockTransport>> {
        timeout(WAIT, async {
            loop {
                let transports = factory.transports();
                if transports.len() >= count {
                    return transports;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("transports should be created")
    }

    /// Run a full in-process client that answers offers through the hub.
    fn spawn_client(
        harness: &Harness,
        client_id: &str,
        role: ClientRole,
        capabilities: Option<ViewerCapabilities>,
    ) -> (Arc<ClientNegotiator>, Arc<MockFactory>) {
        let client_factory = Arc::new(MockFactory::new());
        let negotiator = ClientNegotiator::new(
            ParticipantId::from(client_id),
            role,
            harness.session.id.clone(),
            harness.session.host_signal_id(),
            capabilities,
            Duration::from_millis(20),
            Arc::clone(&client_factory) as Arc<dyn TransportFactory>,
            Arc::new(harness.hub.clone()) as Arc<dyn SignalOutbox>,
        );

        let mut subscription = harness.hub.subscribe(ParticipantId::from(client_id));
        let pump = Arc::clone(&negotiator);
        tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                pump.handle_signal(message).await;
            }
        });

        (negotiator, client_factory)
    }

    #[tokio::test]
    async fn test_end_to_end_handshake_reaches_streaming() {
        let h = harness(None);
        let (_client, _client_factory) = spawn_client(&h, "c1", ClientRole::Controller, None);

        let join = h.registry.add_client(ParticipantId::from("c1")).expect("join");
        assert_eq!(join.role, ClientRole::Controller);

        // Host originates an offer, the client answers through the hub.
        let transports = wait_for_transports(&h.factory, 1).await;
        timeout(WAIT, async {
            while transports[0].applied_answers().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("answer should be applied");

        // Transport-level connectivity completes the state machine.
        transports[0].emit_state(TransportState::Connected);

        let mut state_watch = h.engine.stream_state_watch();
        timeout(WAIT, state_watch.wait_for(|s| *s == StreamState::Streaming))
            .await
            .expect("stream should reach streaming")
            .expect("watch should stay open");

        assert_eq!(
            h.engine.negotiation_phase(ClientRole::Controller).await,
            NegotiationPhase::Connected
        );
    }

    #[tokio::test]
    async fn test_both_roles_negotiate_independently() {
        let h = harness(None);
        let (_c1, _f1) = spawn_client(&h, "c1", ClientRole::Controller, None);
        let (_c2, _f2) = spawn_client(&h, "c2", ClientRole::Viewer, None);

        h.registry.add_client(ParticipantId::from("c1")).expect("join c1");
        h.registry.add_client(ParticipantId::from("c2")).expect("join c2");

        let transports = wait_for_transports(&h.factory, 2).await;
        let roles = h.factory.created_roles();
        assert!(roles.contains(&ClientRole::Controller));
        assert!(roles.contains(&ClientRole::Viewer));

        timeout(WAIT, async {
            loop {
                let done = transports.iter().all(|t| !t.applied_answers().is_empty());
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("both answers should apply");

        // Fail the controller transport; the viewer one must be untouched.
        let controller_transport = h
            .factory
            .last_for_role(ClientRole::Controller)
            .expect("controller transport");
        let viewer_transport = h
            .factory
            .last_for_role(ClientRole::Viewer)
            .expect("viewer transport");
        viewer_transport.emit_state(TransportState::Connected);
        controller_transport.emit_state(TransportState::Failed);

        // A fresh controller transport is negotiated after the cooldown.
        timeout(WAIT, async {
            loop {
                if h.factory
                    .created_roles()
                    .iter()
                    .filter(|r| **r == ClientRole::Controller)
                    .count()
                    >= 2
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("controller should retry with a fresh transport");

        assert!(!viewer_transport.is_closed());
        assert_eq!(
            h.engine.negotiation_phase(ClientRole::Viewer).await,
            NegotiationPhase::Connected
        );
    }

    #[tokio::test]
    async fn test_promotion_renegotiates_under_new_role() {
        let h = harness(None);
        let (_c1, _f1) = spawn_client(&h, "c1", ClientRole::Controller, None);
        let (_c2, _f2) = spawn_client(&h, "c2", ClientRole::Viewer, None);

        h.registry.add_client(ParticipantId::from("c1")).expect("join c1");
        h.registry.add_client(ParticipantId::from("c2")).expect("join c2");
        wait_for_transports(&h.factory, 2).await;

        // Controller leaves; c2 is promoted and must be re-offered under the
        // controller role.
        let outcome = h.registry.remove_client(&ParticipantId::from("c1"));
        assert!(outcome.promoted);

        timeout(WAIT, async {
            loop {
                let roles = h.factory.created_roles();
                if roles
                    .iter()
                    .filter(|r| **r == ClientRole::Controller)
                    .count()
                    >= 2
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("promoted client should get a controller offer");
    }

    #[tokio::test]
    async fn test_viewer_capabilities_drive_display_resize() {
        let display = Arc::new(MockDisplay::new());
        let h = harness(Some(Arc::clone(&display) as Arc<dyn DisplayControl>));
        let caps = ViewerCapabilities {
            width: 2560,
            height: 1440,
            avail_width: 2560,
            avail_height: 1400,
            device_pixel_ratio: 1.0,
        };
        let (_c1, _f1) = spawn_client(&h, "c1", ClientRole::Controller, None);
        let (_c2, _f2) = spawn_client(&h, "c2", ClientRole::Viewer, Some(caps));

        h.registry.add_client(ParticipantId::from("c1")).expect("join c1");
        h.registry.add_client(ParticipantId::from("c2")).expect("join c2");

        timeout(WAIT, async {
            while display.resizes().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("viewer capabilities should trigger a resize");
        assert_eq!(display.resizes()[0], (2560, 1400));
    }

    #[tokio::test]
    async fn test_telemetry_history_is_bounded_and_tuning_applies() {
        let h = harness(None);
        let (_c1, _f1) = spawn_client(&h, "c1", ClientRole::Controller, None);
        h.registry.add_client(ParticipantId::from("c1")).expect("join");

        let transports = wait_for_transports(&h.factory, 1).await;
        transports[0].set_stats(TransportStats {
            bytes_sent: 1_000_000,
            packets_sent: 1_000,
            round_trip_ms: Some(20.0),
            ..TransportStats::default()
        });
        transports[0].emit_state(TransportState::Connected);

        timeout(WAIT, async {
            loop {
                if !h.engine.stats_history(ClientRole::Controller).await.is_empty()
                    && !transports[0].applied_targets().is_empty()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sampler should record history and apply targets");

        let history = h.engine.stats_history(ClientRole::Controller).await;
        assert!(history.len() <= STATS_HISTORY_LEN);
    }

    #[tokio::test]
    async fn test_session_destroy_triggers_engine_shutdown() {
        let h = harness(None);
        let (_c1, _f1) = spawn_client(&h, "c1", ClientRole::Controller, None);
        h.registry.add_client(ParticipantId::from("c1")).expect("join");
        let transports = wait_for_transports(&h.factory, 1).await;

        h.registry.destroy_session();

        let mut state_watch = h.engine.stream_state_watch();
        timeout(WAIT, state_watch.wait_for(|s| *s == StreamState::Idle))
            .await
            .expect("engine should go idle")
            .expect("watch should stay open");
        assert!(transports[0].is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_releases_listeners() {
        let h = harness(None);
        let (_c1, _f1) = spawn_client(&h, "c1", ClientRole::Controller, None);
        h.registry.add_client(ParticipantId::from("c1")).expect("join");
        wait_for_transports(&h.factory, 1).await;

        h.engine.shutdown().await;
        h.engine.shutdown().await;

        assert_eq!(
            h.hub.listener_count(&h.session.host_signal_id()),
            0,
            "host listener should be released"
        );
        assert_eq!(h.hub.listener_count(&ParticipantId::from("c1")), 0);
    }
}
