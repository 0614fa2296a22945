//! Session control endpoints.
//!
//! `POST /session` is an action dispatch (`create`, `destroy`, `status`,
//! `preview`, `join`, `leave`, `toggle-lock`); `GET /session` serves the
//! status snapshot pollers rely on. Session failures surface as structured
//! `{success: false, error}` bodies, never as faults.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use duocast_core::models::{ClientRole, ConnectedClient, ParticipantId, SessionId};
use duocast_core::Error;

use crate::http::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionAction {
    Create,
    Destroy,
    Status,
    Preview,
    Join,
    Leave,
    ToggleLock,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub action: SessionAction,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub host_label: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub access_code: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSession {
    id: SessionId,
    token: String,
    active: bool,
    client_count: usize,
    access_code: String,
    host_label: String,
}

#[derive(Debug, Serialize)]
struct CreateResponse {
    success: bool,
    session: CreatedSession,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    active: bool,
    client_count: usize,
    control_locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    clients: Option<Vec<ConnectedClient>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host_label: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PreviewResponse {
    success: bool,
    host_label: String,
    active: bool,
    client_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinResponse {
    success: bool,
    role: ClientRole,
    session_id: SessionId,
    host_id: ParticipantId,
    host_label: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaveResponse {
    success: bool,
    promoted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    promoted_id: Option<ParticipantId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToggleLockResponse {
    success: bool,
    control_locked: bool,
}

#[derive(Debug, Serialize)]
struct FailureResponse {
    success: bool,
    error: String,
}

fn failure(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(FailureResponse {
            success: false,
            error: error.into(),
        }),
    )
        .into_response()
}

fn session_failure(err: &Error) -> Response {
    failure(StatusCode::FORBIDDEN, err.to_string())
}

/// `POST /session` action dispatch.
pub async fn session_action(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Response {
    match request.action {
        SessionAction::Create => {
            let host_id = match request.host_id {
                Some(id) if !id.trim().is_empty() => ParticipantId::new(id),
                _ => return failure(StatusCode::BAD_REQUEST, "Missing hostId"),
            };
            let session = state
                .registry
                .create_session(host_id, request.host_label.as_deref());
            Json(CreateResponse {
                success: true,
                session: CreatedSession {
                    id: session.id.clone(),
                    token: session.token.clone(),
                    active: session.active,
                    client_count: session.clients.len(),
                    access_code: session.access_code.clone(),
                    host_label: session.host_label,
                },
            })
            .into_response()
        }

        SessionAction::Destroy => {
            state.registry.destroy_session();
            Json(serde_json::json!({ "success": true })).into_response()
        }

        SessionAction::Status => status_response(&state, true).into_response(),

        SessionAction::Preview => {
            let Some(token) = request.token.as_deref() else {
                return failure(StatusCode::BAD_REQUEST, "Missing token");
            };
            match state.registry.validate_token(token, None) {
                Ok(session) => Json(PreviewResponse {
                    success: true,
                    host_label: session.host_label,
                    active: session.active,
                    client_count: session.clients.len(),
                })
                .into_response(),
                Err(err) => session_failure(&err),
            }
        }

        SessionAction::Join => {
            let Some(token) = request.token.as_deref() else {
                return failure(StatusCode::BAD_REQUEST, "Missing token");
            };
            let Some(client_id) = request.client_id.filter(|id| !id.trim().is_empty()) else {
                return failure(StatusCode::BAD_REQUEST, "Missing clientId");
            };

            // Token first, then the access code; both are required to join.
            let session = match state.registry.validate_token(token, None) {
                Ok(session) => session,
                Err(err) => return session_failure(&err),
            };
            match request.access_code.as_deref() {
                Some(code) if code == session.access_code => {}
                _ => return session_failure(&Error::InvalidAccessCode),
            }

            match state.registry.add_client(ParticipantId::new(client_id)) {
                Ok(outcome) => {
                    info!(role = %outcome.role, "Client joined session");
                    Json(JoinResponse {
                        success: true,
                        role: outcome.role,
                        session_id: session.id,
                        host_id: session.host_id,
                        host_label: session.host_label,
                    })
                    .into_response()
                }
                Err(err) => session_failure(&err),
            }
        }

        SessionAction::Leave => {
            let Some(client_id) = request.client_id else {
                return failure(StatusCode::BAD_REQUEST, "Missing clientId");
            };
            let outcome = state.registry.remove_client(&ParticipantId::new(client_id));
            Json(LeaveResponse {
                success: true,
                promoted: outcome.promoted,
                promoted_id: outcome.promoted_id,
            })
            .into_response()
        }

        SessionAction::ToggleLock => {
            let control_locked = state.registry.toggle_control_lock();
            Json(ToggleLockResponse {
                success: true,
                control_locked,
            })
            .into_response()
        }
    }
}

/// `GET /session` status snapshot. Omits the token; only the host's own
/// `status` action gets credentials back.
pub async fn session_status(State(state): State<AppState>) -> Response {
    status_response(&state, false).into_response()
}

fn status_response(state: &AppState, include_credentials: bool) -> Json<StatusResponse> {
    match state.registry.current() {
        Some(session) => Json(StatusResponse {
            active: session.active,
            client_count: session.clients.len(),
            control_locked: session.control_locked,
            clients: Some(session.clients),
            token: include_credentials.then_some(session.token),
            session_id: include_credentials.then_some(session.id),
            host_label: Some(session.host_label),
        }),
        None => Json(StatusResponse {
            active: false,
            client_count: 0,
            control_locked: false,
            clients: None,
            token: None,
            session_id: None,
            host_label: None,
        }),
    }
}
