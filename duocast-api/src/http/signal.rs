//! Signaling endpoints.
//!
//! `POST /signal` validates the closed payload union at the boundary and
//! fans the message out through the hub. `GET /signal?listenerId=ID` opens
//! the long-lived per-participant push channel: discrete JSON frames over
//! SSE, a `connected` acknowledgment first, heartbeats roughly every 15
//! seconds to defeat idle-connection timeouts. Closing the response
//! unsubscribes the listener; nothing sent while disconnected is redelivered.

use axum::{
    extract::{Query, State},
    response::{
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
        IntoResponse,
    },
    Json,
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::debug;

use duocast_core::models::{ParticipantId, SignalMessage};
use duocast_core::SignalSubscription;

use crate::http::error::{AppError, AppResult};
use crate::http::AppState;

/// Interval between SSE heartbeat frames.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// `POST /signal`: submit one signaling message for delivery.
pub async fn submit_signal(
    State(state): State<AppState>,
    Json(message): Json<SignalMessage>,
) -> AppResult<impl IntoResponse> {
    let delivered = state.hub.send(message);
    if delivered == 0 {
        // At-most-once, unbuffered: no listener at send time means the
        // message is gone. The caller still gets an ack.
        debug!("Signal had no subscribed listener");
    }
    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerQuery {
    #[serde(default)]
    pub listener_id: Option<String>,
}

/// `GET /signal?listenerId=ID`: open the push channel for one participant.
pub async fn signal_stream(
    State(state): State<AppState>,
    Query(query): Query<ListenerQuery>,
) -> AppResult<Sse<KeepAliveStream<SignalEventStream>>> {
    let Some(listener_id) = query.listener_id.filter(|id| !id.trim().is_empty()) else {
        return Err(AppError::bad_request("Missing listenerId"));
    };

    let subscription = state.hub.subscribe(ParticipantId::new(listener_id.clone()));
    let stream = SignalEventStream::new(listener_id, subscription);

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    ))
}

/// SSE frames for one listener: a `connected` acknowledgment, then one frame
/// per delivered message. Dropping the stream releases the hub registration.
pub struct SignalEventStream {
    connected_frame: Option<Event>,
    subscription: SignalSubscription,
}

impl SignalEventStream {
    fn new(listener_id: String, subscription: SignalSubscription) -> Self {
        let ack = serde_json::json!({ "type": "connected", "listenerId": listener_id });
        Self {
            connected_frame: Some(Event::default().data(ack.to_string())),
            subscription,
        }
    }
}

impl Stream for SignalEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(frame) = self.connected_frame.take() {
            return Poll::Ready(Some(Ok(frame)));
        }

        match self.subscription.poll_recv(cx) {
            Poll::Ready(Some(message)) => match serde_json::to_string(&message) {
                Ok(json) => Poll::Ready(Some(Ok(Event::default().data(json)))),
                Err(e) => {
                    debug!(error = %e, "Skipping unserializable signal frame");
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            },
            // Registration removed hub-side (session destroyed): end the
            // channel, recovery is a fresh handshake.
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
