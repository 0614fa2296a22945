//! In-memory doubles for negotiation and quality tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use duocast_core::models::{ClientRole, IceCandidate, SignalMessage};

use crate::quality::DisplayControl;
use crate::transport::{
    EncodingTarget, PeerTransport, Result, SignalOutbox, TransportError, TransportEvent,
    TransportFactory, TransportState, TransportStats,
};

/// Scriptable in-memory transport.
pub struct MockTransport {
    id: u64,
    offers: AtomicU64,
    applied_answers: Mutex<Vec<String>>,
    remote_offers: Mutex<Vec<String>>,
    answers_created: AtomicU64,
    candidates: Mutex<Vec<IceCandidate>>,
    targets: Mutex<Vec<EncodingTarget>>,
    stats: Mutex<TransportStats>,
    fail_encoding: AtomicBool,
    fail_stats: AtomicBool,
    closed: AtomicBool,
    events_tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_id(0)
    }

    pub fn with_id(id: u64) -> Self {
        Self {
            id,
            offers: AtomicU64::new(0),
            applied_answers: Mutex::new(Vec::new()),
            remote_offers: Mutex::new(Vec::new()),
            answers_created: AtomicU64::new(0),
            candidates: Mutex::new(Vec::new()),
            targets: Mutex::new(Vec::new()),
            stats: Mutex::new(TransportStats::default()),
            fail_encoding: AtomicBool::new(false),
            fail_stats: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events_tx: Mutex::new(None),
        }
    }

    fn attach_events(&self, tx: mpsc::UnboundedSender<TransportEvent>) {
        *self.events_tx.lock() = Some(tx);
    }

    pub fn emit_state(&self, state: TransportState) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(TransportEvent::StateChange(state));
        }
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(TransportEvent::LocalCandidate(candidate));
        }
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock() = stats;
    }

    pub fn fail_encoding(&self, fail: bool) {
        self.fail_encoding.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stats(&self, fail: bool) {
        self.fail_stats.store(fail, Ordering::SeqCst);
    }

    pub fn answer_count(&self) -> u64 {
        self.answers_created.load(Ordering::SeqCst)
    }

    pub fn applied_answers(&self) -> Vec<String> {
        self.applied_answers.lock().clone()
    }

    pub fn remote_offers(&self) -> Vec<String> {
        self.remote_offers.lock().clone()
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn applied_targets(&self) -> Vec<EncodingTarget> {
        self.targets.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<String> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(format!("v=0 offer-{}-{n}", self.id))
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.applied_answers.lock().push(sdp.to_string());
        Ok(())
    }

    async fn apply_remote_offer(&self, sdp: &str) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.remote_offers.lock().push(sdp.to_string());
        Ok(())
    }

    async fn create_answer(&self) -> Result<String> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let n = self.answers_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("v=0 answer-{}-{n}", self.id))
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.candidates.lock().push(candidate.clone());
        Ok(())
    }

    async fn apply_encoding_target(&self, target: EncodingTarget) -> Result<()> {
        if self.fail_encoding.load(Ordering::SeqCst) {
            return Err(TransportError::Channel("encoder rejected parameters".to_string()));
        }
        self.targets.lock().push(target);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        if self.fail_stats.load(Ordering::SeqCst) {
            return Err(TransportError::Stats("transport gone".to_string()));
        }
        Ok(self.stats.lock().clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the sender ends the event pump, as the real transport does.
        self.events_tx.lock().take();
    }
}

/// Factory that records every transport it hands out.
pub struct MockFactory {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    roles: Mutex<Vec<ClientRole>>,
    fail_next: AtomicBool,
    counter: AtomicU64,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            transports: Mutex::new(Vec::new()),
            roles: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            counter: AtomicU64::new(0),
        }
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().clone()
    }

    pub fn created_roles(&self) -> Vec<ClientRole> {
        self.roles.lock().clone()
    }

    /// Most recent transport created for a role, if any.
    pub fn last_for_role(&self, role: ClientRole) -> Option<Arc<MockTransport>> {
        let roles = self.roles.lock();
        let transports = self.transports.lock();
        roles
            .iter()
            .zip(transports.iter())
            .rev()
            .find(|(r, _)| **r == role)
            .map(|(_, t)| Arc::clone(t))
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        role: ClientRole,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>)> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Sdp("factory unavailable".to_string()));
        }

        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(MockTransport::with_id(id));
        let (tx, rx) = mpsc::unbounded_channel();
        transport.attach_events(tx);

        self.transports.lock().push(Arc::clone(&transport));
        self.roles.lock().push(role);
        Ok((transport, rx))
    }
}

/// Outbox that captures everything instead of delivering it.
pub struct CapturingOutbox {
    messages: Mutex<Vec<SignalMessage>>,
}

impl CapturingOutbox {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<SignalMessage> {
        self.messages.lock().clone()
    }
}

impl SignalOutbox for CapturingOutbox {
    fn send(&self, message: SignalMessage) {
        self.messages.lock().push(message);
    }
}

/// Display agent double recording resize requests.
pub struct MockDisplay {
    resizes: Mutex<Vec<(u32, u32)>>,
    fail: AtomicBool,
}

impl MockDisplay {
    pub fn new() -> Self {
        Self {
            resizes: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn resizes(&self) -> Vec<(u32, u32)> {
        self.resizes.lock().clone()
    }
}

#[async_trait]
impl DisplayControl for MockDisplay {
    async fn resize_display(&self, width: u32, height: u32) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("agent unreachable");
        }
        self.resizes.lock().push((width, height));
        Ok(())
    }
}
