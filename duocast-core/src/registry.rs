//! Session registry: owns the single active session, its roster, and locks.
//!
//! One instance is constructed at process start and shared by reference into
//! every handler. All mutations are short synchronous critical sections;
//! concurrent requests (a join racing a destroy) are resolved by re-checking
//! session state at each boundary rather than by holding locks across awaits.

use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::session::MAX_CLIENTS;
use crate::models::{
    ClientRole, ConnectedClient, ParticipantId, RosterSnapshot, Session, SessionId, SessionStatus,
};
use crate::relay::SignalHub;

/// Result of a join attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub role: ClientRole,
    /// False when the client was already in the roster (idempotent rejoin)
    pub newly_joined: bool,
}

/// Result of removing a client
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoveOutcome {
    pub promoted: bool,
    pub promoted_id: Option<ParticipantId>,
}

/// Owner of the single active [`Session`].
pub struct SessionRegistry {
    session: RwLock<Option<Session>>,
    hub: SignalHub,
    roster_tx: watch::Sender<RosterSnapshot>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(hub: SignalHub) -> Self {
        let (roster_tx, _) = watch::channel(RosterSnapshot::default());
        Self {
            session: RwLock::new(None),
            hub,
            roster_tx,
        }
    }

    /// The signal hub this registry cleans up through.
    #[must_use]
    pub fn hub(&self) -> &SignalHub {
        &self.hub
    }

    /// Observe roster changes without polling. The receiver yields a snapshot
    /// on every create/destroy/join/leave.
    #[must_use]
    pub fn roster_watch(&self) -> watch::Receiver<RosterSnapshot> {
        self.roster_tx.subscribe()
    }

    /// Create a new session, destroying any prior active one first. Always
    /// succeeds.
    pub fn create_session(
        &self,
        host_id: ParticipantId,
        host_label: Option<&str>,
    ) -> Session {
        if self.session.read().as_ref().is_some_and(|s| s.active) {
            self.destroy_session();
        }

        let label = match host_label.map(str::trim) {
            Some(l) if !l.is_empty() => l.to_string(),
            _ => format!("Host-{}", truncate(host_id.as_str(), 6)),
        };

        let session = Session {
            id: SessionId::new(random_hex(16)),
            token: random_hex(32),
            access_code: random_access_code(),
            host_id,
            host_label: label,
            active: true,
            created_at: Utc::now(),
            clients: Vec::new(),
            max_clients: MAX_CLIENTS,
            control_locked: false,
        };

        *self.session.write() = Some(session.clone());
        self.publish_roster();

        info!(session_id = %session.id, host_id = %session.host_id, "Session created");
        session
    }

    /// Mark the session inactive, clear the roster, and release every signal
    /// listener registration tied to it. Idempotent.
    pub fn destroy_session(&self) {
        let destroyed = self.session.write().take().map(|session| session.id);

        // Listeners are released regardless, so nothing can deliver into a
        // dead session.
        self.hub.clear();
        self.publish_roster();

        if let Some(id) = destroyed {
            info!(session_id = %id, "Session destroyed");
        }
    }

    /// Snapshot of the current session, if any.
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        self.session.read().clone()
    }

    /// Lightweight status for pollers.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        match self.session.read().as_ref() {
            Some(s) => SessionStatus {
                active: s.active,
                client_count: s.clients.len(),
                control_locked: s.control_locked,
            },
            None => SessionStatus {
                active: false,
                client_count: 0,
                control_locked: false,
            },
        }
    }

    /// Validate a bearer token and, when supplied, the access code. Returns a
    /// snapshot of the active session on success.
    pub fn validate_token(&self, token: &str, access_code: Option<&str>) -> Result<Session> {
        let guard = self.session.read();
        let session = guard
            .as_ref()
            .filter(|s| s.active && s.token == token)
            .ok_or(Error::SessionEnded)?;

        if let Some(code) = access_code {
            if session.access_code != code {
                return Err(Error::InvalidAccessCode);
            }
        }

        Ok(session.clone())
    }

    /// Add a client to the roster. Re-joining with the same id is idempotent.
    /// The first joiner becomes the controller, the second a viewer; any
    /// further join fails with [`Error::HostFull`].
    pub fn add_client(&self, client_id: ParticipantId) -> Result<JoinOutcome> {
        let outcome = {
            let mut guard = self.session.write();
            let session = guard
                .as_mut()
                .filter(|s| s.active)
                .ok_or(Error::SessionEnded)?;

            if let Some(existing) = session.clients.iter().find(|c| c.id == client_id) {
                return Ok(JoinOutcome {
                    role: existing.role,
                    newly_joined: false,
                });
            }

            if session.clients.len() >= session.max_clients {
                return Err(Error::HostFull);
            }

            let role = if session.clients.is_empty() {
                ClientRole::Controller
            } else {
                ClientRole::Viewer
            };
            session.clients.push(ConnectedClient {
                id: client_id.clone(),
                role,
                connected_at: Utc::now(),
            });

            JoinOutcome {
                role,
                newly_joined: true,
            }
        };

        self.publish_roster();
        debug!(client_id = %client_id, role = %outcome.role, "Client joined");
        Ok(outcome)
    }

    /// Remove a client by id. If the removed client held the controller role
    /// and at least one client remains, the earliest remaining client is
    /// promoted to controller.
    pub fn remove_client(&self, client_id: &ParticipantId) -> RemoveOutcome {
        let outcome = {
            let mut guard = self.session.write();
            let Some(session) = guard.as_mut() else {
                return RemoveOutcome::default();
            };

            let Some(index) = session.clients.iter().position(|c| &c.id == client_id) else {
                return RemoveOutcome::default();
            };

            let removed = session.clients.remove(index);

            if removed.role == ClientRole::Controller && !session.clients.is_empty() {
                session.clients[0].role = ClientRole::Controller;
                RemoveOutcome {
                    promoted: true,
                    promoted_id: Some(session.clients[0].id.clone()),
                }
            } else {
                RemoveOutcome::default()
            }
        };

        self.hub.remove_listener(client_id);
        self.publish_roster();

        if let Some(promoted) = &outcome.promoted_id {
            info!(removed = %client_id, promoted = %promoted, "Controller left, promoted next client");
        } else {
            debug!(client_id = %client_id, "Client removed");
        }
        outcome
    }

    /// Role currently held by a client, if present.
    #[must_use]
    pub fn client_role(&self, client_id: &ParticipantId) -> Option<ClientRole> {
        self.session
            .read()
            .as_ref()
            .and_then(|s| s.role_of(client_id))
    }

    /// Flip the control lock consumed by the input-authorization capability.
    /// Returns the new state; false when no session is active.
    pub fn toggle_control_lock(&self) -> bool {
        let mut guard = self.session.write();
        match guard.as_mut() {
            Some(session) => {
                session.control_locked = !session.control_locked;
                session.control_locked
            }
            None => false,
        }
    }

    fn publish_roster(&self) {
        let snapshot = match self.session.read().as_ref() {
            Some(s) if s.active => RosterSnapshot {
                session_id: Some(s.id.clone()),
                host_id: Some(s.host_id.clone()),
                clients: s.clients.clone(),
            },
            _ => RosterSnapshot::default(),
        };
        // Receivers may come and go; a send with no receiver is fine.
        let _ = self.roster_tx.send(snapshot);
    }
}

fn truncate(s: &str, len: usize) -> &str {
    match s.char_indices().nth(len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill(&mut buf[..]);
    hex::encode(buf)
}

fn random_access_code() -> String {
    rand::rng().random_range(100_000..=999_999u32).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(SignalHub::new())
    }

    #[test]
    fn test_create_session_generates_credentials() {
        let registry = registry();
        let session = registry.create_session(ParticipantId::from("h1"), None);

        assert!(session.active);
        assert_eq!(session.token.len(), 64);
        assert_eq!(session.id.as_str().len(), 32);
        assert_eq!(session.access_code.len(), 6);
        assert!(session.access_code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(session.host_label, "Host-h1");
        assert!(session.clients.is_empty());
    }

    #[test]
    fn test_create_replaces_active_session() {
        let registry = registry();
        let first = registry.create_session(ParticipantId::from("h1"), None);
        let second = registry.create_session(ParticipantId::from("h1"), Some("Desk"));

        assert_ne!(first.token, second.token);
        assert_eq!(second.host_label, "Desk");
        let current = registry.current().expect("session should exist");
        assert_eq!(current.id, second.id);
    }

    #[test]
    fn test_join_roles_and_host_full() {
        let registry = registry();
        registry.create_session(ParticipantId::from("h1"), None);

        let c1 = registry.add_client(ParticipantId::from("c1")).expect("first join");
        assert_eq!(c1.role, ClientRole::Controller);
        assert!(c1.newly_joined);

        let c2 = registry.add_client(ParticipantId::from("c2")).expect("second join");
        assert_eq!(c2.role, ClientRole::Viewer);

        let err = registry.add_client(ParticipantId::from("c3")).unwrap_err();
        assert!(matches!(err, Error::HostFull));

        let session = registry.current().expect("session should exist");
        assert!(session.clients.len() <= MAX_CLIENTS);
        assert_eq!(
            session
                .clients
                .iter()
                .filter(|c| c.role == ClientRole::Controller)
                .count(),
            1
        );
    }

    #[test]
    fn test_rejoin_is_idempotent() {
        let registry = registry();
        registry.create_session(ParticipantId::from("h1"), None);

        registry.add_client(ParticipantId::from("c1")).expect("join");
        let again = registry.add_client(ParticipantId::from("c1")).expect("rejoin");
        assert_eq!(again.role, ClientRole::Controller);
        assert!(!again.newly_joined);
        assert_eq!(registry.current().expect("session").clients.len(), 1);
    }

    #[test]
    fn test_remove_controller_promotes_earliest() {
        let registry = registry();
        registry.create_session(ParticipantId::from("h1"), None);
        registry.add_client(ParticipantId::from("c1")).expect("join c1");
        registry.add_client(ParticipantId::from("c2")).expect("join c2");

        let outcome = registry.remove_client(&ParticipantId::from("c1"));
        assert!(outcome.promoted);
        assert_eq!(outcome.promoted_id, Some(ParticipantId::from("c2")));
        assert_eq!(
            registry.client_role(&ParticipantId::from("c2")),
            Some(ClientRole::Controller)
        );
    }

    #[test]
    fn test_remove_viewer_does_not_promote() {
        let registry = registry();
        registry.create_session(ParticipantId::from("h1"), None);
        registry.add_client(ParticipantId::from("c1")).expect("join c1");
        registry.add_client(ParticipantId::from("c2")).expect("join c2");

        let outcome = registry.remove_client(&ParticipantId::from("c2"));
        assert!(!outcome.promoted);
        assert_eq!(
            registry.client_role(&ParticipantId::from("c1")),
            Some(ClientRole::Controller)
        );
    }

    #[test]
    fn test_remove_unknown_client_is_noop() {
        let registry = registry();
        registry.create_session(ParticipantId::from("h1"), None);
        let outcome = registry.remove_client(&ParticipantId::from("ghost"));
        assert_eq!(outcome, RemoveOutcome::default());
    }

    #[test]
    fn test_validate_token() {
        let registry = registry();
        let session = registry.create_session(ParticipantId::from("h1"), None);

        assert!(registry.validate_token(&session.token, None).is_ok());
        assert!(registry
            .validate_token(&session.token, Some(&session.access_code))
            .is_ok());

        let err = registry.validate_token("bogus", None).unwrap_err();
        assert!(matches!(err, Error::SessionEnded));

        let err = registry
            .validate_token(&session.token, Some("000000"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAccessCode));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let registry = registry();
        registry.create_session(ParticipantId::from("h1"), None);
        registry.destroy_session();
        registry.destroy_session();

        assert!(registry.current().is_none());
        assert!(!registry.status().active);
    }

    #[test]
    fn test_destroy_releases_signal_listeners() {
        let registry = registry();
        registry.create_session(ParticipantId::from("h1"), None);
        let _sub = registry.hub().subscribe(ParticipantId::from("c1"));
        assert_eq!(registry.hub().listener_count(&ParticipantId::from("c1")), 1);

        registry.destroy_session();
        assert_eq!(registry.hub().listener_count(&ParticipantId::from("c1")), 0);
    }

    #[test]
    fn test_toggle_control_lock() {
        let registry = registry();
        assert!(!registry.toggle_control_lock());

        registry.create_session(ParticipantId::from("h1"), None);
        assert!(registry.toggle_control_lock());
        assert!(!registry.toggle_control_lock());
    }

    #[tokio::test]
    async fn test_roster_watch_sees_joins() {
        let registry = registry();
        let mut watch = registry.roster_watch();

        registry.create_session(ParticipantId::from("h1"), None);
        watch.changed().await.expect("roster update");
        assert!(watch.borrow_and_update().is_active());

        registry.add_client(ParticipantId::from("c1")).expect("join");
        watch.changed().await.expect("roster update");
        assert_eq!(watch.borrow_and_update().clients.len(), 1);
    }
}
