//! Per-connection signaling state machine.
//!
//! ```text
//! Unjoined --join-meeting--> Joined --leave-meeting | disconnect | room-closed--> Left
//! ```
//!
//! Every request in `Joined` is delegated to the participant's room. Requests
//! in `Unjoined` (other than `join-meeting`) or in `Left` fail with
//! `InvalidState` and never reach a room.
//!
//! Leaving runs the room removal exactly once per session, whether it was
//! triggered by `leave-meeting` or by the connection going away.

use crate::actors::messages::{ConsumeOutcome, RemovalOutcome, RoomEvent};
use crate::actors::{RoomHandle, RoomRegistryHandle};
use crate::directory::{
    MeetingDirectory, MeetingRecord, ParticipantRecord, ParticipantUpdates, UserIdentity,
};
use crate::errors::SfuError;

use super::protocol::{JoinReply, ReplyData, SignalingRequest};

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: RoomRegistryHandle,
    pub directory: Arc<dyn MeetingDirectory>,
}

struct JoinedState {
    meeting: MeetingRecord,
    participant: ParticipantRecord,
    room: RoomHandle,
}

enum SessionState {
    Unjoined,
    Joined(Box<JoinedState>),
    Left,
}

/// Status flags a participant can change about itself.
#[derive(Debug, Clone, Copy)]
enum StatusChange {
    ToggleMute,
    ToggleVideo,
    ToggleHand,
    ScreenShare(bool),
}

pub struct SignalingSession {
    connection_id: String,
    user: UserIdentity,
    context: SessionContext,
    events: mpsc::Sender<RoomEvent>,
    state: SessionState,
}

impl SignalingSession {
    /// `events` is registered with the room on join; the caller relays what
    /// arrives on it to the client.
    #[must_use]
    pub fn new(
        connection_id: String,
        user: UserIdentity,
        context: SessionContext,
        events: mpsc::Sender<RoomEvent>,
    ) -> Self {
        Self {
            connection_id,
            user,
            context,
            events,
            state: SessionState::Unjoined,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        matches!(self.state, SessionState::Joined(_))
    }

    #[must_use]
    pub fn has_left(&self) -> bool {
        matches!(self.state, SessionState::Left)
    }

    /// `InvalidState` unless the session is joined, with the same message the
    /// request handlers use.
    ///
    /// # Errors
    ///
    /// `SfuError::InvalidState` before join or after leaving.
    pub fn ensure_joined(&self) -> Result<(), SfuError> {
        require_joined(&self.state).map(|_| ())
    }

    #[must_use]
    pub fn participant_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Joined(joined) => Some(joined.participant.id.as_str()),
            SessionState::Unjoined | SessionState::Left => None,
        }
    }

    /// Handle one request. `Ok(None)` is a plain acknowledgement.
    ///
    /// # Errors
    ///
    /// `InvalidState` when the request is not allowed in the current state,
    /// otherwise whatever the directory or room returned.
    pub async fn handle(
        &mut self,
        request: SignalingRequest,
    ) -> Result<Option<ReplyData>, SfuError> {
        match request {
            SignalingRequest::JoinMeeting(join) => self
                .join(join.meeting_id, join.password)
                .await
                .map(|reply| Some(ReplyData::Joined(Box::new(reply)))),

            SignalingRequest::CreateTransport(create) => {
                let joined = require_joined(&self.state)?;
                debug!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    direction = ?create.direction,
                    "Creating transport"
                );
                let transport = joined
                    .room
                    .create_transport(joined.participant.id.clone())
                    .await?;
                Ok(Some(ReplyData::Transport(transport)))
            }

            SignalingRequest::ConnectTransport(connect) => {
                let joined = require_joined(&self.state)?;
                joined
                    .room
                    .connect_transport(
                        joined.participant.id.clone(),
                        connect.transport_id,
                        connect.dtls_parameters,
                    )
                    .await?;
                Ok(None)
            }

            SignalingRequest::Produce(produce) => {
                let joined = require_joined(&self.state)?;
                let producer_id = joined
                    .room
                    .produce(
                        joined.participant.id.clone(),
                        produce.transport_id,
                        produce.kind,
                        produce.rtp_parameters,
                    )
                    .await?;
                Ok(Some(ReplyData::Produced { producer_id }))
            }

            SignalingRequest::Consume(consume) => {
                let joined = require_joined(&self.state)?;
                let producer_id = consume.producer_id.clone();
                let outcome = joined
                    .room
                    .consume(
                        joined.participant.id.clone(),
                        consume.transport_id,
                        consume.producer_id,
                        consume.rtp_capabilities,
                    )
                    .await?;
                Ok(Some(match outcome {
                    ConsumeOutcome::Consumer(consumer) => ReplyData::Consumer(consumer),
                    ConsumeOutcome::Incompatible => ReplyData::Incompatible {
                        producer_id,
                        incompatible: true,
                    },
                }))
            }

            SignalingRequest::ResumeConsumer(target) => {
                let joined = require_joined(&self.state)?;
                joined
                    .room
                    .resume_consumer(joined.participant.id.clone(), target.consumer_id)
                    .await?;
                Ok(None)
            }

            SignalingRequest::PauseProducer(target) => {
                let joined = require_joined(&self.state)?;
                joined
                    .room
                    .pause_producer(joined.participant.id.clone(), target.producer_id)
                    .await?;
                Ok(None)
            }

            SignalingRequest::ResumeProducer(target) => {
                let joined = require_joined(&self.state)?;
                joined
                    .room
                    .resume_producer(joined.participant.id.clone(), target.producer_id)
                    .await?;
                Ok(None)
            }

            SignalingRequest::CloseProducer(target) => {
                let joined = require_joined(&self.state)?;
                joined
                    .room
                    .close_producer(joined.participant.id.clone(), target.producer_id)
                    .await?;
                Ok(None)
            }

            SignalingRequest::ToggleMute => self.change_status(StatusChange::ToggleMute).await,
            SignalingRequest::ToggleVideo => self.change_status(StatusChange::ToggleVideo).await,
            SignalingRequest::ToggleHand => self.change_status(StatusChange::ToggleHand).await,
            SignalingRequest::StartScreenShare => {
                self.change_status(StatusChange::ScreenShare(true)).await
            }
            SignalingRequest::StopScreenShare => {
                self.change_status(StatusChange::ScreenShare(false)).await
            }

            SignalingRequest::LeaveMeeting => {
                require_joined(&self.state)?;
                self.leave().await?;
                Ok(None)
            }
        }
    }

    async fn join(
        &mut self,
        meeting_id: String,
        password: Option<String>,
    ) -> Result<JoinReply, SfuError> {
        match &self.state {
            SessionState::Joined(joined) if joined.meeting.id == meeting_id => {
                // Repeated join on the same connection: answer with a fresh
                // snapshot, membership is unchanged.
                return self.snapshot(joined).await;
            }
            SessionState::Joined(_) => {
                return Err(SfuError::InvalidState(
                    "Already joined another meeting".to_string(),
                ));
            }
            SessionState::Left => return Err(left_error()),
            SessionState::Unjoined => {}
        }

        let grant = self
            .context
            .directory
            .join(&meeting_id, &self.user, password.as_deref())
            .await?;
        let participant_id = grant.participant.id.clone();

        let room = match self.context.registry.get_or_create(meeting_id.clone()).await {
            Ok(room) => room,
            Err(e) => {
                self.mark_left(&meeting_id, &participant_id).await;
                return Err(e);
            }
        };

        let rejoined = match room
            .add_participant(
                participant_id.clone(),
                self.connection_id.clone(),
                self.events.clone(),
            )
            .await
        {
            Ok(()) => false,
            Err(SfuError::AlreadyMember) => {
                room.rebind_participant(
                    participant_id.clone(),
                    self.connection_id.clone(),
                    self.events.clone(),
                )
                .await?;
                true
            }
            Err(e) => {
                self.mark_left(&meeting_id, &participant_id).await;
                return Err(e);
            }
        };

        let joined = JoinedState {
            meeting: grant.meeting,
            participant: grant.participant,
            room,
        };

        if !rejoined {
            joined
                .room
                .broadcast(
                    Some(participant_id.clone()),
                    RoomEvent::ParticipantJoined {
                        participant: joined.participant.clone(),
                    },
                )
                .await?;
        }

        let reply = self.snapshot(&joined).await;
        self.state = SessionState::Joined(Box::new(joined));

        info!(
            target: "sfu.signaling",
            connection_id = %self.connection_id,
            meeting_id = %meeting_id,
            participant_id = %participant_id,
            rejoined,
            "Participant joined"
        );

        reply
    }

    async fn snapshot(&self, joined: &JoinedState) -> Result<JoinReply, SfuError> {
        let producers = joined
            .room
            .list_remote_producers(joined.participant.id.clone())
            .await?;
        let existing_participants = self
            .context
            .directory
            .active_participants(&joined.meeting.id)
            .await?
            .into_iter()
            .filter(|p| p.id != joined.participant.id)
            .collect();

        Ok(JoinReply {
            meeting: joined.meeting.clone(),
            participant: joined.participant.clone(),
            rtp_capabilities: joined.room.rtp_capabilities().clone(),
            existing_participants,
            producers,
        })
    }

    async fn change_status(&mut self, change: StatusChange) -> Result<Option<ReplyData>, SfuError> {
        let joined = require_joined_mut(&mut self.state)?;
        let current = &joined.participant;

        let updates = match change {
            StatusChange::ToggleMute => ParticipantUpdates {
                is_muted: Some(!current.is_muted),
                ..ParticipantUpdates::default()
            },
            StatusChange::ToggleVideo => ParticipantUpdates {
                is_video_on: Some(!current.is_video_on),
                ..ParticipantUpdates::default()
            },
            StatusChange::ToggleHand => ParticipantUpdates {
                is_hand_raised: Some(!current.is_hand_raised),
                ..ParticipantUpdates::default()
            },
            StatusChange::ScreenShare(on) => ParticipantUpdates {
                is_screen_sharing: Some(on),
                ..ParticipantUpdates::default()
            },
        };

        let record = self
            .context
            .directory
            .update_participant(&joined.meeting.id, &joined.participant.id, &updates)
            .await?;
        joined.participant = record;

        joined
            .room
            .broadcast(
                Some(joined.participant.id.clone()),
                RoomEvent::ParticipantUpdated {
                    participant_id: joined.participant.id.clone(),
                    updates: updates.clone(),
                },
            )
            .await?;

        Ok(Some(ReplyData::Updated(updates)))
    }

    /// React to an event delivered by the room. `room-closed` and
    /// `session-replaced` end the session.
    pub async fn on_room_event(&mut self, event: &RoomEvent) {
        if let RoomEvent::SessionReplaced { participant_id } = event {
            if self.participant_id() == Some(participant_id.as_str()) {
                // Membership now belongs to the newer connection; nothing to
                // tear down or record here.
                self.state = SessionState::Left;
                info!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    participant_id = %participant_id,
                    "Session replaced by a newer connection"
                );
            }
            return;
        }

        let RoomEvent::RoomClosed { meeting_id } = event else {
            return;
        };

        let SessionState::Joined(joined) = &self.state else {
            return;
        };
        if joined.meeting.id != *meeting_id {
            return;
        }

        let participant_id = joined.participant.id.clone();
        self.state = SessionState::Left;
        self.mark_left(meeting_id, &participant_id).await;

        info!(
            target: "sfu.signaling",
            connection_id = %self.connection_id,
            meeting_id = %meeting_id,
            participant_id = %participant_id,
            "Room closed, session left"
        );
    }

    /// The connection is gone. Runs the leave teardown if still joined.
    /// Calling it again is a no-op.
    pub async fn disconnect(&mut self) {
        if self.is_joined() {
            // A replaced session has nothing to tear down.
            let _ = self.leave().await;
        }
        self.state = SessionState::Left;
    }

    /// Fails with `InvalidState` when the participant was taken over by a
    /// newer connection; its membership is left alone.
    async fn leave(&mut self) -> Result<(), SfuError> {
        let SessionState::Joined(joined) = std::mem::replace(&mut self.state, SessionState::Left)
        else {
            return Ok(());
        };
        let JoinedState {
            meeting,
            participant,
            room,
        } = *joined;

        let outcome = room
            .remove_participant(participant.id.clone(), Some(self.connection_id.clone()))
            .await;

        match outcome {
            Ok(RemovalOutcome::Removed) => {
                self.mark_left(&meeting.id, &participant.id).await;
                if let Err(e) = room
                    .broadcast(
                        None,
                        RoomEvent::ParticipantLeft {
                            participant_id: participant.id.clone(),
                        },
                    )
                    .await
                {
                    debug!(
                        target: "sfu.signaling",
                        meeting_id = %meeting.id,
                        error = %e,
                        "Room gone before participant-left could be sent"
                    );
                }
            }
            Ok(RemovalOutcome::NotPresent) => {
                self.mark_left(&meeting.id, &participant.id).await;
            }
            Ok(RemovalOutcome::Superseded) => {
                debug!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    participant_id = %participant.id,
                    "Participant rejoined on another connection, keeping membership"
                );
                return Err(SfuError::InvalidState(
                    "Session was replaced by a newer connection".to_string(),
                ));
            }
            Err(e) => {
                warn!(
                    target: "sfu.signaling",
                    meeting_id = %meeting.id,
                    participant_id = %participant.id,
                    error = %e,
                    "Room removal failed during leave"
                );
                self.mark_left(&meeting.id, &participant.id).await;
            }
        }

        info!(
            target: "sfu.signaling",
            connection_id = %self.connection_id,
            meeting_id = %meeting.id,
            participant_id = %participant.id,
            "Participant left"
        );
        Ok(())
    }

    async fn mark_left(&self, meeting_id: &str, participant_id: &str) {
        if let Err(e) = self
            .context
            .directory
            .mark_left(meeting_id, participant_id)
            .await
        {
            warn!(
                target: "sfu.signaling",
                meeting_id = %meeting_id,
                participant_id = %participant_id,
                error = %e,
                "Failed to record participant leave"
            );
        }
    }
}

fn require_joined(state: &SessionState) -> Result<&JoinedState, SfuError> {
    match state {
        SessionState::Joined(joined) => Ok(joined),
        SessionState::Unjoined => Err(not_joined_error()),
        SessionState::Left => Err(left_error()),
    }
}

fn require_joined_mut(state: &mut SessionState) -> Result<&mut JoinedState, SfuError> {
    match state {
        SessionState::Joined(joined) => Ok(joined),
        SessionState::Unjoined => Err(not_joined_error()),
        SessionState::Left => Err(left_error()),
    }
}

fn not_joined_error() -> SfuError {
    SfuError::InvalidState("Not joined to a meeting".to_string())
}

fn left_error() -> SfuError {
    SfuError::InvalidState("Session has left the meeting".to_string())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, RoomSettings};
    use crate::config::default_media_codecs;
    use crate::directory::{InMemoryDirectory, MeetingSettings};
    use crate::engine::{LoopbackEngine, MediaEngineGateway, TransportOptions, WorkerSettings};
    use crate::signaling::protocol::{
        CreateTransportRequest, JoinMeetingRequest, ProducerTarget,
    };
    use crate::workers::EngineWorkerPool;

    struct Fixture {
        context: SessionContext,
        directory: Arc<InMemoryDirectory>,
    }

    async fn fixture() -> Fixture {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = MediaEngineGateway::new(engine);
        let settings = WorkerSettings {
            rtc_min_port: 40000,
            rtc_max_port: 40100,
            log_level: "warn".to_string(),
        };
        let pool = EngineWorkerPool::initialize(gateway.clone(), 1, &settings)
            .await
            .unwrap();
        let registry = RoomRegistryHandle::new(
            "sfu-test".to_string(),
            pool,
            gateway,
            RoomSettings {
                media_codecs: default_media_codecs(),
                transport_options: TransportOptions::default(),
            },
            ActorMetrics::new(),
        );
        let directory = Arc::new(InMemoryDirectory::new(true, 10).with_bcrypt_cost(4));
        Fixture {
            context: SessionContext {
                registry,
                directory: directory.clone(),
            },
            directory,
        }
    }

    fn session(
        fixture: &Fixture,
        connection_id: &str,
        user_id: &str,
    ) -> (SignalingSession, mpsc::Receiver<RoomEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let user = UserIdentity {
            user_id: user_id.to_string(),
            display_name: user_id.to_uppercase(),
        };
        (
            SignalingSession::new(connection_id.to_string(), user, fixture.context.clone(), tx),
            rx,
        )
    }

    fn join(meeting_id: &str) -> SignalingRequest {
        SignalingRequest::JoinMeeting(JoinMeetingRequest {
            meeting_id: meeting_id.to_string(),
            password: None,
        })
    }

    #[tokio::test]
    async fn test_requests_before_join_are_rejected() {
        let f = fixture().await;
        let (mut s, _rx) = session(&f, "c1", "alice");

        let result = s
            .handle(SignalingRequest::CreateTransport(CreateTransportRequest::default()))
            .await;
        assert!(matches!(result, Err(SfuError::InvalidState(_))));

        let result = s.handle(SignalingRequest::LeaveMeeting).await;
        assert!(matches!(result, Err(SfuError::InvalidState(_))));
        assert!(!s.is_joined());
    }

    #[tokio::test]
    async fn test_join_replies_with_snapshot() {
        let f = fixture().await;
        let (mut alice, _a_rx) = session(&f, "c1", "alice");
        let (mut bob, _b_rx) = session(&f, "c2", "bob");

        alice.handle(join("m-1")).await.unwrap();
        let reply = bob.handle(join("m-1")).await.unwrap();

        let Some(ReplyData::Joined(reply)) = reply else {
            panic!("expected join reply");
        };
        assert_eq!(reply.meeting.id, "m-1");
        assert_eq!(reply.existing_participants.len(), 1);
        assert_eq!(reply.existing_participants[0].user_id, "alice");
        assert!(!reply.rtp_capabilities.codecs.is_empty());
        assert!(bob.is_joined());
    }

    #[tokio::test]
    async fn test_join_broadcasts_to_existing_members() {
        let f = fixture().await;
        let (mut alice, mut a_rx) = session(&f, "c1", "alice");
        let (mut bob, _b_rx) = session(&f, "c2", "bob");

        alice.handle(join("m-1")).await.unwrap();
        bob.handle(join("m-1")).await.unwrap();

        let event = a_rx.recv().await.unwrap();
        let RoomEvent::ParticipantJoined { participant } = event else {
            panic!("expected participant-joined, got {event:?}");
        };
        assert_eq!(participant.user_id, "bob");
    }

    #[tokio::test]
    async fn test_repeated_join_is_idempotent() {
        let f = fixture().await;
        let (mut alice, _rx) = session(&f, "c1", "alice");

        alice.handle(join("m-1")).await.unwrap();
        let first = alice.participant_id().unwrap().to_string();
        alice.handle(join("m-1")).await.unwrap();

        assert_eq!(alice.participant_id().unwrap(), first);
        assert!(matches!(
            alice.handle(join("m-2")).await,
            Err(SfuError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_join_with_wrong_password_stays_unjoined() {
        let f = fixture().await;
        f.directory
            .register_meeting(MeetingSettings {
                meeting_id: Some("locked".to_string()),
                title: "Locked".to_string(),
                host_id: "host".to_string(),
                password: Some("hunter2".to_string()),
                ..MeetingSettings::default()
            })
            .await
            .unwrap();

        let (mut alice, _rx) = session(&f, "c1", "alice");
        let result = alice
            .handle(SignalingRequest::JoinMeeting(JoinMeetingRequest {
                meeting_id: "locked".to_string(),
                password: Some("wrong".to_string()),
            }))
            .await;

        assert_eq!(result, Err(SfuError::InvalidPassword));
        assert!(!alice.is_joined());
        assert!(f.context.registry.get("locked".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_leave_then_everything_is_invalid() {
        let f = fixture().await;
        let (mut alice, _a_rx) = session(&f, "c1", "alice");
        let (mut bob, mut b_rx) = session(&f, "c2", "bob");

        bob.handle(join("m-1")).await.unwrap();
        alice.handle(join("m-1")).await.unwrap();
        let _joined = b_rx.recv().await.unwrap();

        alice.handle(SignalingRequest::LeaveMeeting).await.unwrap();
        assert!(alice.has_left());

        let event = b_rx.recv().await.unwrap();
        assert!(matches!(event, RoomEvent::ParticipantLeft { .. }));

        assert!(matches!(
            alice.handle(join("m-1")).await,
            Err(SfuError::InvalidState(_))
        ));
        assert!(matches!(
            alice
                .handle(SignalingRequest::PauseProducer(ProducerTarget {
                    producer_id: "x".to_string()
                }))
                .await,
            Err(SfuError::InvalidState(_))
        ));

        let active = f.directory.active_participants("m-1").await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let f = fixture().await;
        let (mut alice, _rx) = session(&f, "c1", "alice");
        alice.handle(join("m-1")).await.unwrap();

        alice.disconnect().await;
        alice.disconnect().await;

        let room = f.context.registry.get("m-1".to_string()).await.unwrap().unwrap();
        assert!(room.get_state().await.unwrap().participants.is_empty());
        assert!(f.directory.active_participants("m-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_toggle_mute_updates_directory_and_peers() {
        let f = fixture().await;
        let (mut alice, _a_rx) = session(&f, "c1", "alice");
        let (mut bob, mut b_rx) = session(&f, "c2", "bob");

        bob.handle(join("m-1")).await.unwrap();
        alice.handle(join("m-1")).await.unwrap();
        let _joined = b_rx.recv().await.unwrap();

        let reply = alice.handle(SignalingRequest::ToggleMute).await.unwrap();
        assert_eq!(
            reply,
            Some(ReplyData::Updated(ParticipantUpdates {
                is_muted: Some(true),
                ..ParticipantUpdates::default()
            }))
        );

        let event = b_rx.recv().await.unwrap();
        let RoomEvent::ParticipantUpdated { updates, .. } = event else {
            panic!("expected participant-updated, got {event:?}");
        };
        assert_eq!(updates.is_muted, Some(true));

        // Second toggle flips back.
        let reply = alice.handle(SignalingRequest::ToggleMute).await.unwrap();
        let Some(ReplyData::Updated(updates)) = reply else {
            panic!("expected update reply");
        };
        assert_eq!(updates.is_muted, Some(false));
    }

    #[tokio::test]
    async fn test_room_closed_moves_session_to_left() {
        let f = fixture().await;
        let (mut alice, mut rx) = session(&f, "c1", "alice");
        alice.handle(join("m-1")).await.unwrap();

        f.context.registry.remove("m-1".to_string()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RoomEvent::RoomClosed { .. }));

        alice.on_room_event(&event).await;
        assert!(alice.has_left());
        assert!(f.directory.active_participants("m-1").await.unwrap().is_empty());

        // Disconnect after room-closed does nothing further.
        alice.disconnect().await;
    }

    #[tokio::test]
    async fn test_stale_connection_disconnect_keeps_rejoined_member() {
        let f = fixture().await;
        let (mut old, _old_rx) = session(&f, "c-old", "alice");
        let (mut new, _new_rx) = session(&f, "c-new", "alice");

        old.handle(join("m-1")).await.unwrap();
        new.handle(join("m-1")).await.unwrap();
        assert_eq!(old.participant_id(), new.participant_id());

        old.disconnect().await;

        let room = f.context.registry.get("m-1".to_string()).await.unwrap().unwrap();
        assert_eq!(room.get_state().await.unwrap().participants.len(), 1);
        assert_eq!(f.directory.active_participants("m-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replaced_session_can_no_longer_act() {
        let f = fixture().await;
        let (mut old, mut old_rx) = session(&f, "c-old", "alice");
        let (mut new, _new_rx) = session(&f, "c-new", "alice");

        old.handle(join("m-1")).await.unwrap();
        new.handle(join("m-1")).await.unwrap();

        let replaced = loop {
            let event = old_rx.try_recv().expect("session-replaced queued on rejoin");
            if matches!(event, RoomEvent::SessionReplaced { .. }) {
                break event;
            }
        };
        old.on_room_event(&replaced).await;
        assert!(old.has_left());

        let result = old
            .handle(SignalingRequest::CreateTransport(CreateTransportRequest::default()))
            .await;
        assert!(matches!(result, Err(SfuError::InvalidState(_))));
        let result = old.handle(SignalingRequest::LeaveMeeting).await;
        assert!(matches!(result, Err(SfuError::InvalidState(_))));

        let room = f.context.registry.get("m-1".to_string()).await.unwrap().unwrap();
        assert_eq!(room.get_state().await.unwrap().participants.len(), 1);
        assert_eq!(f.directory.active_participants("m-1").await.unwrap().len(), 1);
        assert!(new.is_joined());
    }

    #[tokio::test]
    async fn test_stale_leave_is_rejected_without_touching_membership() {
        let f = fixture().await;
        let (mut old, _old_rx) = session(&f, "c-old", "alice");
        let (mut new, _new_rx) = session(&f, "c-new", "alice");

        old.handle(join("m-1")).await.unwrap();
        new.handle(join("m-1")).await.unwrap();

        // The replacement event has not been processed yet.
        let result = old.handle(SignalingRequest::LeaveMeeting).await;
        assert!(matches!(result, Err(SfuError::InvalidState(_))));
        assert!(old.has_left());

        let room = f.context.registry.get("m-1".to_string()).await.unwrap().unwrap();
        assert_eq!(room.get_state().await.unwrap().participants.len(), 1);
        assert_eq!(f.directory.active_participants("m-1").await.unwrap().len(), 1);
    }
}
