//! WebSocket signaling endpoint (`GET /ws`).
//!
//! The user token is taken from `Authorization: Bearer <token>` or, for
//! browsers that cannot set headers on a WebSocket, the `token` query
//! parameter. It is validated before the upgrade; a missing or bad token
//! gets `401` and no socket.
//!
//! After the upgrade the socket is split: a reader task feeds text frames to
//! the connection's `ConnectionActor` and a writer task drains the actor's
//! outbound frames.

use crate::actors::{ActorMetrics, ActorType, ConnectionActor};
use crate::auth::TokenValidator;
use crate::directory::UserIdentity;

use super::session::SessionContext;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Frames buffered for the socket writer.
const OUTBOUND_BUFFER: usize = 256;

/// Largest inbound message accepted (1 MiB).
const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Shared state for the signaling router.
pub struct SignalingState {
    validator: TokenValidator,
    context: SessionContext,
    metrics: Arc<ActorMetrics>,
    /// Parent of every connection's token.
    cancel_token: CancellationToken,
}

impl SignalingState {
    #[must_use]
    pub fn new(
        validator: TokenValidator,
        context: SessionContext,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            validator,
            context,
            metrics,
            cancel_token,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    token: Option<String>,
}

/// Create the signaling router.
pub fn signaling_router(state: Arc<SignalingState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn ws_handler(
    State(state): State<Arc<SignalingState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let Some(token) = bearer_token(&headers).or(params.token.as_deref()) else {
        return (StatusCode::UNAUTHORIZED, "Missing access token").into_response();
    };

    let user = match state.validator.validate(token) {
        Ok(user) => user,
        Err(e) => return (StatusCode::UNAUTHORIZED, e.client_message()).into_response(),
    };

    if state.cancel_token.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }

    let Some(upgrade) = upgrade else {
        return (StatusCode::BAD_REQUEST, "Expected a WebSocket upgrade").into_response();
    };

    upgrade
        .max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| serve_socket(socket, user, state))
}

async fn serve_socket(socket: WebSocket, user: UserIdentity, state: Arc<SignalingState>) {
    let connection_id = Uuid::new_v4().to_string();
    let user_id = user.user_id.clone();
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut frames) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    let (handle, mut task) = ConnectionActor::spawn(
        connection_id.clone(),
        user,
        state.context.clone(),
        outbound,
        state.cancel_token.child_token(),
        Arc::clone(&state.metrics),
    );

    info!(
        target: "sfu.signaling",
        connection_id = %connection_id,
        user_id = %user_id,
        "Signaling connection opened"
    );

    let writer = tokio::spawn(async move {
        while let Some(text) = frames.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut actor_done = false;
    let reason = loop {
        tokio::select! {
            result = &mut task => {
                actor_done = true;
                if matches!(&result, Err(e) if e.is_panic()) {
                    state.metrics.record_panic(ActorType::Connection);
                }
                break "connection actor stopped";
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle.deliver(text).await.is_err() {
                            break "connection actor gone";
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "client closed",
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(
                            target: "sfu.signaling",
                            connection_id = %connection_id,
                            error = %e,
                            "WebSocket receive failed"
                        );
                        break "socket error";
                    }
                }
            }
        }
    };

    if !actor_done {
        let _ = handle.close(reason.to_string()).await;
        if let Err(e) = task.await {
            if e.is_panic() {
                state.metrics.record_panic(ActorType::Connection);
            }
        }
    }
    let _ = writer.await;

    info!(
        target: "sfu.signaling",
        connection_id = %connection_id,
        reason,
        "Signaling connection closed"
    );
}
