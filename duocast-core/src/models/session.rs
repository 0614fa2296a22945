//! Session and roster models.
//!
//! Exactly one [`Session`] exists per process at a time. The roster holds at
//! most two [`ConnectedClient`] entries: the first joiner is the `controller`
//! (may drive remote input over the side-channel), the second a passive
//! `viewer`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{ParticipantId, SessionId};

/// Maximum number of simultaneous clients per session.
pub const MAX_CLIENTS: usize = 2;

/// Role a client holds within the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Controller,
    Viewer,
}

impl ClientRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Viewer => "viewer",
        }
    }
}

impl std::fmt::Display for ClientRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client currently present in the roster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedClient {
    pub id: ParticipantId,
    pub role: ClientRole,
    pub connected_at: DateTime<Utc>,
}

/// The single active session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub token: String,
    pub access_code: String,
    pub host_id: ParticipantId,
    pub host_label: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub clients: Vec<ConnectedClient>,
    pub max_clients: usize,
    pub control_locked: bool,
}

impl Session {
    /// Signaling address of the host for this session.
    #[must_use]
    pub fn host_signal_id(&self) -> ParticipantId {
        ParticipantId::new(format!("host-{}", self.host_id))
    }

    #[must_use]
    pub fn client(&self, id: &ParticipantId) -> Option<&ConnectedClient> {
        self.clients.iter().find(|c| &c.id == id)
    }

    #[must_use]
    pub fn role_of(&self, id: &ParticipantId) -> Option<ClientRole> {
        self.client(id).map(|c| c.role)
    }
}

/// Lightweight status snapshot served to pollers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub active: bool,
    pub client_count: usize,
    pub control_locked: bool,
}

/// Roster snapshot published on the registry's watch channel whenever the
/// session or its roster changes. Observers (the host engine) reconcile
/// against this instead of polling.
#[derive(Debug, Clone, Default)]
pub struct RosterSnapshot {
    pub session_id: Option<SessionId>,
    pub host_id: Option<ParticipantId>,
    pub clients: Vec<ConnectedClient>,
}

impl RosterSnapshot {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.session_id.is_some()
    }
}
