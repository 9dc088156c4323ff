//! Realtime channel: `GET /api/ws` upgrades to a WebSocket that receives
//! events for the caller's owner key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use codedrop_auth::ResolutionMode;
use codedrop_core::protocol::{
    ConnectedData, EventEnvelope, CLOSE_TOO_MANY_CONNECTIONS, EVENT_CONNECTED,
};
use codedrop_core::OwnerKey;
use codedrop_realtime::broker::{Connection, Delivery};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::identity::{authorization_bearer, resolve_credentials, SESSION_ID_HEADER};
use crate::{ApiState, HttpFailure};

/// Frames buffered per connection before new events are dropped.
const OUTBOUND_CHANNEL_SIZE: usize = 64;
const WS_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WsQuery {
    token: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

struct SocketConnection {
    outbound: mpsc::Sender<Arc<str>>,
    closed: Arc<AtomicBool>,
}

impl Connection for SocketConnection {
    fn send(&self, frame: Arc<str>) -> Delivery {
        if self.is_closed() {
            return Delivery::Closed;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed) || self.outbound.is_closed()
    }
}

/// Credentials come from the `token` query parameter, then the
/// `Authorization` header; the session from `sessionId`, then `X-Session-Id`.
pub(crate) async fn websocket_upgrade(
    State(state): State<ApiState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let bearer = query
        .token
        .as_deref()
        .filter(|token| !token.is_empty())
        .or_else(|| authorization_bearer(&headers));
    let session_id = query
        .session_id
        .as_deref()
        .filter(|session| !session.is_empty())
        .or_else(|| {
            headers
                .get(SESSION_ID_HEADER)
                .and_then(|value| value.to_str().ok())
        });

    let identity =
        match resolve_credentials(&state, ResolutionMode::Optional, bearer, session_id).await {
            Ok(identity) => identity,
            Err(failure) => return failure.into_response(),
        };
    let Some(owner) = identity.owner_key() else {
        return HttpFailure::new(
            axum::http::StatusCode::UNAUTHORIZED,
            "Authentication or session ID required",
        )
        .into_response();
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    upgrade.on_upgrade(move |socket| serve_websocket(socket, state, owner))
}

async fn serve_websocket(mut socket: WebSocket, state: ApiState, owner: OwnerKey) {
    let registry = state.registry();
    let (outbound, mut outbound_rx) = mpsc::channel::<Arc<str>>(OUTBOUND_CHANNEL_SIZE);
    let closed = Arc::new(AtomicBool::new(false));

    // The welcome frame is first in the queue, ahead of any event.
    match EventEnvelope::new(
        EVENT_CONNECTED,
        ConnectedData {
            owner_key: owner.to_string(),
        },
    )
    .to_json()
    {
        Ok(welcome) => {
            let _ = outbound.try_send(Arc::from(welcome));
        }
        Err(error) => tracing::error!(error = %error, "failed to encode welcome frame"),
    }

    let connection_id = match registry.register(
        owner.clone(),
        Arc::new(SocketConnection {
            outbound: outbound.clone(),
            closed: Arc::clone(&closed),
        }),
    ) {
        Ok(connection_id) => connection_id,
        Err(error) => {
            tracing::debug!(owner = %owner, error = %error, "realtime connection refused");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_TOO_MANY_CONNECTIONS,
                    reason: "too many connections".into(),
                })))
                .await;
            return;
        }
    };
    tracing::debug!(owner = %owner, "realtime connection opened");

    let (mut socket_sender, mut socket_receiver) = socket.split();
    let writer_closed = Arc::clone(&closed);
    let writer = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(WS_KEEPALIVE_INTERVAL);
        keepalive.tick().await;
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if socket_sender
                        .send(Message::Text(frame.as_ref().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                _ = keepalive.tick() => {
                    if socket_sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        writer_closed.store(true, Ordering::Relaxed);
    });

    // Inbound frames carry nothing; read only to notice the close.
    while let Some(message) = socket_receiver.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    closed.store(true, Ordering::Relaxed);
    registry.unregister(&owner, connection_id);
    drop(outbound);
    let _ = writer.await;
    tracing::debug!(owner = %owner, "realtime connection closed");
}
