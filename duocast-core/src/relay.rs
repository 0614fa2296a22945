//! In-process signaling relay.
//!
//! [`SignalHub`] routes addressed [`SignalMessage`]s to per-participant push
//! channels. Delivery is at-most-once and unbuffered: a message sent while no
//! listener is subscribed under its `to` id is dropped. Recovery after a
//! disconnect is a fresh negotiation handshake, never message replay.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{ParticipantId, SignalMessage};

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<SignalMessage>,
}

/// Per-participant signal delivery fabric.
///
/// Cheap to clone; all clones share the same listener table.
#[derive(Clone)]
pub struct SignalHub {
    listeners: Arc<DashMap<ParticipantId, Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl SignalHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a listener under `listener_id`. Multiple subscriptions per id
    /// are allowed. Dropping the returned subscription unregisters it.
    pub fn subscribe(&self, listener_id: ParticipantId) -> SignalSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.listeners
            .entry(listener_id.clone())
            .or_default()
            .push(Subscriber { id, sender: tx });

        debug!(listener_id = %listener_id, subscription = id, "Signal listener subscribed");

        SignalSubscription {
            hub: self.clone(),
            listener_id,
            id,
            rx,
        }
    }

    /// Deliver a message to every listener subscribed under `message.to`.
    /// Returns the number of listeners reached; zero means the message was
    /// dropped.
    pub fn send(&self, message: SignalMessage) -> usize {
        let mut delivered = 0;

        if let Some(mut subscribers) = self.listeners.get_mut(&message.to) {
            subscribers.retain(|sub| match sub.sender.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    warn!(
                        listener_id = %message.to,
                        subscription = sub.id,
                        "Dropping dead signal listener"
                    );
                    false
                }
            });
        }

        if delivered == 0 {
            debug!(
                to = %message.to,
                from = %message.from,
                kind = message.payload.kind(),
                "Signal dropped, no listener subscribed"
            );
        }

        delivered
    }

    /// Remove every subscription registered under one participant id.
    pub fn remove_listener(&self, listener_id: &ParticipantId) {
        if self.listeners.remove(listener_id).is_some() {
            debug!(listener_id = %listener_id, "Signal listener registrations removed");
        }
    }

    /// Drop every registration. Used when the session is destroyed so nothing
    /// can be delivered into a dead session.
    pub fn clear(&self) {
        self.listeners.clear();
    }

    /// Number of live subscriptions under one id.
    #[must_use]
    pub fn listener_count(&self, listener_id: &ParticipantId) -> usize {
        self.listeners
            .get(listener_id)
            .map_or(0, |subs| subs.len())
    }

    fn unsubscribe(&self, listener_id: &ParticipantId, id: u64) {
        if let Some(mut subscribers) = self.listeners.get_mut(listener_id) {
            subscribers.retain(|sub| sub.id != id);
            if subscribers.is_empty() {
                drop(subscribers);
                self.listeners
                    .remove_if(listener_id, |_, subs| subs.is_empty());
            }
        }
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live listener registration. Receives messages addressed to its id and
/// unregisters itself when dropped.
pub struct SignalSubscription {
    hub: SignalHub,
    listener_id: ParticipantId,
    id: u64,
    rx: mpsc::UnboundedReceiver<SignalMessage>,
}

impl SignalSubscription {
    #[must_use]
    pub fn listener_id(&self) -> &ParticipantId {
        &self.listener_id
    }

    /// Receive the next message addressed to this listener. Returns `None`
    /// once the registration has been removed hub-side (session destroyed or
    /// listener evicted).
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.rx.recv().await
    }

    /// Non-blocking receive, used by pull-style consumers.
    pub fn try_recv(&mut self) -> Option<SignalMessage> {
        self.rx.try_recv().ok()
    }

    /// Poll-based receive for stream adapters.
    pub fn poll_recv(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<SignalMessage>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.listener_id, self.id);
    }
}
