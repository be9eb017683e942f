//! `ConnectionActor` - one actor per signaling connection.
//!
//! Each `ConnectionActor`:
//! - Owns the connection's `SignalingSession`
//! - Decodes inbound frames and handles them strictly in order, one reply
//!   per request
//! - Relays room events to the client between requests
//!
//! # Lifecycle
//!
//! 1. Spawned when the socket is upgraded and the user token validated
//! 2. Runs until the socket closes, the outbound side goes away, or the token
//!    is cancelled
//! 3. On exit the session's disconnect teardown runs exactly once

use crate::directory::UserIdentity;
use crate::errors::SfuError;
use crate::observability::metrics as prom;
use crate::signaling::protocol::{ClientFrame, ServerReply};
use crate::signaling::session::{SessionContext, SignalingSession};

use super::messages::{ConnectionMessage, RoomEvent};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use serde::Serialize;
use serde_json::Value;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Room events queued for one connection before fan-out starts dropping.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Deliver a text frame received from the client.
    pub async fn deliver(&self, text: String) -> Result<(), SfuError> {
        self.sender
            .send(ConnectionMessage::Inbound { text })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    /// Tell the actor the socket closed.
    pub async fn close(&self, reason: String) -> Result<(), SfuError> {
        self.sender
            .send(ConnectionMessage::Close { reason })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: String,
    user_id: String,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Room events registered with the session's room.
    events: mpsc::Receiver<RoomEvent>,
    /// Serialized frames for the socket writer.
    outbound: mpsc::Sender<String>,
    session: SignalingSession,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Frames for the client are written to `outbound`; the actor stops when
    /// that channel closes.
    pub fn spawn(
        connection_id: String,
        user: UserIdentity,
        context: SessionContext,
        outbound: mpsc::Sender<String>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let user_id = user.user_id.clone();
        let session = SignalingSession::new(connection_id.clone(), user, context, events_tx);

        metrics.connection_created();

        let actor = Self {
            connection_id: connection_id.clone(),
            user_id,
            receiver,
            events,
            outbound,
            session,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Connection, &connection_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "sfu.actor.connection",
        fields(connection_id = %self.connection_id, user_id = %self.user_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        let reason = loop {
            tokio::select! {
                // Room events first: a `session-replaced` already queued must
                // land before any later request from this connection.
                biased;

                () = self.cancel_token.cancelled() => {
                    break "cancelled".to_string();
                }

                Some(event) = self.events.recv() => {
                    let flow = self.send(&event).await;
                    self.session.on_room_event(&event).await;
                    if flow.is_break() {
                        break "outbound closed".to_string();
                    }
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(ConnectionMessage::Inbound { text }) => {
                            self.mailbox.record_enqueue();
                            let flow = self.handle_frame(&text).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if flow.is_break() {
                                break "outbound closed".to_string();
                            }
                        }
                        Some(ConnectionMessage::Close { reason }) => break reason,
                        None => break "channel closed".to_string(),
                    }
                }
            }
        };

        self.session.disconnect().await;
        self.metrics.connection_closed();

        info!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            reason = %reason,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Decode, handle and answer one frame.
    async fn handle_frame(&mut self, text: &str) -> ControlFlow<()> {
        let started = Instant::now();

        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                let error = SfuError::InvalidRequest(format!("Malformed frame: {e}"));
                prom::record_signaling_latency("invalid", "error", started.elapsed());
                return self.send(&ServerReply::error(Value::Null, &error)).await;
            }
        };

        let id = frame.id.clone();
        if let Some(message_type) = frame.known_type().filter(|t| *t != "join-meeting") {
            // Session state is checked before the payload is decoded.
            if let Err(e) = self.session.ensure_joined() {
                prom::record_signaling_latency(message_type, "error", started.elapsed());
                log_request_error(&self.connection_id, message_type, &e);
                return self.send(&ServerReply::error(id, &e)).await;
            }
        }

        let request = match frame.into_request() {
            Ok(request) => request,
            Err(e) => {
                prom::record_signaling_latency("invalid", "error", started.elapsed());
                return self.send(&ServerReply::error(id, &e)).await;
            }
        };

        let message_type = request.message_type();
        let reply = match self.session.handle(request).await {
            Ok(data) => {
                prom::record_signaling_latency(message_type, "success", started.elapsed());
                ServerReply::ok(id, data)
            }
            Err(e) => {
                prom::record_signaling_latency(message_type, "error", started.elapsed());
                log_request_error(&self.connection_id, message_type, &e);
                ServerReply::error(id, &e)
            }
        };

        self.send(&reply).await
    }

    async fn send<T: Serialize>(&self, message: &T) -> ControlFlow<()> {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    target: "sfu.actor.connection",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Failed to serialize outbound frame"
                );
                return ControlFlow::Continue(());
            }
        };

        if self.outbound.send(text).await.is_err() {
            debug!(
                target: "sfu.actor.connection",
                connection_id = %self.connection_id,
                "Outbound channel closed"
            );
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }
}

/// Client mistakes are debug noise; engine and internal failures are not.
fn log_request_error(connection_id: &str, message_type: &str, error: &SfuError) {
    match error {
        SfuError::Engine(_)
        | SfuError::Internal(_)
        | SfuError::WorkerFatal { .. }
        | SfuError::Config(_) => {
            warn!(
                target: "sfu.actor.connection",
                connection_id = %connection_id,
                message_type,
                error = %error,
                "Signaling request failed"
            );
        }
        _ => {
            debug!(
                target: "sfu.actor.connection",
                connection_id = %connection_id,
                message_type,
                error = %error,
                "Signaling request rejected"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::actors::{RoomRegistryHandle, RoomSettings};
    use crate::config::default_media_codecs;
    use crate::directory::{InMemoryDirectory, MeetingDirectory};
    use crate::engine::{LoopbackEngine, MediaEngineGateway, TransportOptions, WorkerSettings};
    use crate::workers::EngineWorkerPool;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        context: SessionContext,
        directory: Arc<InMemoryDirectory>,
        metrics: Arc<ActorMetrics>,
    }

    async fn fixture() -> Fixture {
        let gateway = MediaEngineGateway::new(Arc::new(LoopbackEngine::new()));
        let settings = WorkerSettings {
            rtc_min_port: 40000,
            rtc_max_port: 40100,
            log_level: "warn".to_string(),
        };
        let pool = EngineWorkerPool::initialize(gateway.clone(), 1, &settings)
            .await
            .unwrap();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(
            "sfu-test".to_string(),
            pool,
            gateway,
            RoomSettings {
                media_codecs: default_media_codecs(),
                transport_options: TransportOptions::default(),
            },
            Arc::clone(&metrics),
        );
        let directory = Arc::new(InMemoryDirectory::new(true, 10).with_bcrypt_cost(4));
        Fixture {
            context: SessionContext {
                registry,
                directory: directory.clone(),
            },
            directory,
            metrics,
        }
    }

    fn spawn(
        fixture: &Fixture,
        connection_id: &str,
        user_id: &str,
    ) -> (ConnectionActorHandle, JoinHandle<()>, mpsc::Receiver<String>) {
        let (outbound, frames) = mpsc::channel(64);
        let user = UserIdentity {
            user_id: user_id.to_string(),
            display_name: user_id.to_string(),
        };
        let (handle, task) = ConnectionActor::spawn(
            connection_id.to_string(),
            user,
            fixture.context.clone(),
            outbound,
            CancellationToken::new(),
            Arc::clone(&fixture.metrics),
        );
        (handle, task, frames)
    }

    async fn next_frame(frames: &mut mpsc::Receiver<String>) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .expect("frame timeout")
            .expect("outbound closed");
        serde_json::from_str(&text).unwrap()
    }

    async fn request(
        handle: &ConnectionActorHandle,
        frames: &mut mpsc::Receiver<String>,
        frame: Value,
    ) -> Value {
        handle.deliver(frame.to_string()).await.unwrap();
        next_frame(frames).await
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_reply() {
        let f = fixture().await;
        let (handle, _task, mut frames) = spawn(&f, "c1", "alice");

        handle.deliver("{not json".to_string()).await.unwrap();
        let reply = next_frame(&mut frames).await;

        assert_eq!(reply["success"], json!(false));
        assert_eq!(reply["error"]["code"], json!("INVALID_REQUEST"));
    }

    #[tokio::test]
    async fn test_request_before_join_is_invalid_state() {
        let f = fixture().await;
        let (handle, _task, mut frames) = spawn(&f, "c1", "alice");

        let reply = request(
            &handle,
            &mut frames,
            json!({"id": 1, "type": "create-transport", "data": {"direction": "send"}}),
        )
        .await;

        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["error"]["code"], json!("INVALID_STATE"));
    }

    #[tokio::test]
    async fn test_replies_follow_request_order() {
        let f = fixture().await;
        let (handle, _task, mut frames) = spawn(&f, "c1", "alice");

        handle
            .deliver(json!({"id": 1, "type": "join-meeting", "data": {"meetingId": "m-1"}}).to_string())
            .await
            .unwrap();
        handle
            .deliver(json!({"id": 2, "type": "create-transport"}).to_string())
            .await
            .unwrap();
        handle
            .deliver(json!({"id": 3, "type": "toggle-hand"}).to_string())
            .await
            .unwrap();

        for expected in 1..=3 {
            let reply = next_frame(&mut frames).await;
            assert_eq!(reply["id"], json!(expected));
            assert_eq!(reply["success"], json!(true), "reply {reply}");
        }
    }

    #[tokio::test]
    async fn test_room_events_are_relayed() {
        let f = fixture().await;
        let (alice, _a_task, mut a_frames) = spawn(&f, "c1", "alice");
        let (bob, _b_task, mut b_frames) = spawn(&f, "c2", "bob");

        let join = json!({"id": 1, "type": "join-meeting", "data": {"meetingId": "m-1"}});
        request(&alice, &mut a_frames, join.clone()).await;
        request(&bob, &mut b_frames, join).await;

        let event = next_frame(&mut a_frames).await;
        assert_eq!(event["event"], json!("participant-joined"));
        assert_eq!(event["data"]["participant"]["userId"], json!("bob"));
    }

    #[tokio::test]
    async fn test_close_runs_disconnect_teardown() {
        let f = fixture().await;
        let (alice, a_task, mut a_frames) = spawn(&f, "c1", "alice");

        request(
            &alice,
            &mut a_frames,
            json!({"id": 1, "type": "join-meeting", "data": {"meetingId": "m-1"}}),
        )
        .await;
        assert_eq!(f.metrics.connection_count(), 1);

        alice.close("socket closed".to_string()).await.unwrap();
        a_task.await.unwrap();

        assert!(f.directory.active_participants("m-1").await.unwrap().is_empty());
        assert_eq!(f.metrics.connection_count(), 0);
        let room = f.context.registry.get("m-1".to_string()).await.unwrap().unwrap();
        assert!(room.get_state().await.unwrap().participants.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_runs_disconnect_teardown() {
        let f = fixture().await;
        let (alice, a_task, mut a_frames) = spawn(&f, "c1", "alice");

        request(
            &alice,
            &mut a_frames,
            json!({"id": 1, "type": "join-meeting", "data": {"meetingId": "m-1"}}),
        )
        .await;

        alice.cancel();
        a_task.await.unwrap();

        assert!(alice.is_cancelled());
        assert!(f.directory.active_participants("m-1").await.unwrap().is_empty());
    }
}
