//! `RoomActor` - one actor per active meeting.
//!
//! The room owns its router and the participant map (participant id →
//! `ResourceGraph`). Every structural change goes through the room's mailbox,
//! so mutations of one room never interleave while different rooms run in
//! parallel.
//!
//! # Engine calls
//!
//! Slow engine calls (create/connect transport, produce, consume) do not
//! block the mailbox. The actor validates the request, spawns the engine
//! call, and the spawned task sends an internal completion message back. The
//! completion is committed only if the participant is still the same member
//! (same epoch) and the referenced resources still exist; otherwise the new
//! engine resource is closed and the request fails. A half-registered
//! resource is never visible.
//!
//! Quick calls (pause/resume, close producer) run inline.
//!
//! # Events
//!
//! Each member registers an event queue. Fan-out uses `try_send`, so a slow
//! member loses events (counted as drops) instead of stalling the room.

use crate::engine::{
    ConsumerDescriptor, DtlsParameters, MediaEngineGateway, MediaKind, RouterInfo,
    RtpCapabilities, RtpParameters, TransportDescriptor, TransportOptions, WorkerId,
};
use crate::errors::{EngineError, ResourceKind, SfuError};

use super::graph::{ConsumerEntry, ProducerEntry, ResourceGraph};
use super::messages::{
    ConsumeOutcome, ParticipantStats, RemoteProducer, RemovalOutcome, RoomEvent, RoomMessage,
    RoomState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const ROOM_CHANNEL_BUFFER: usize = 500;

/// Handle to a `RoomActor`.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    meeting_id: String,
    router_id: String,
    worker_id: WorkerId,
    rtp_capabilities: Arc<RtpCapabilities>,
}

impl RoomHandle {
    #[must_use]
    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    #[must_use]
    pub fn router_id(&self) -> &str {
        &self.router_id
    }

    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Router RTP capabilities, sent to clients on join.
    #[must_use]
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Register a participant with an empty resource graph.
    ///
    /// Fails with `AlreadyMember` if the participant is present.
    pub async fn add_participant(
        &self,
        participant_id: String,
        connection_id: String,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::AddParticipant {
            participant_id,
            connection_id,
            events,
            respond_to,
        })
        .await?
    }

    /// Move an existing member to a new connection, keeping its resources.
    pub async fn rebind_participant(
        &self,
        participant_id: String,
        connection_id: String,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::RebindParticipant {
            participant_id,
            connection_id,
            events,
            respond_to,
        })
        .await?
    }

    /// Remove a participant and close its resources (consumers, then
    /// producers, then transports). Resolves after teardown finished.
    ///
    /// With `connection_id` set, a participant bound to a different
    /// connection is left alone (`Superseded`).
    pub async fn remove_participant(
        &self,
        participant_id: String,
        connection_id: Option<String>,
    ) -> Result<RemovalOutcome, SfuError> {
        self.request(|respond_to| RoomMessage::RemoveParticipant {
            participant_id,
            connection_id,
            respond_to,
        })
        .await
    }

    pub async fn create_transport(
        &self,
        participant_id: String,
    ) -> Result<TransportDescriptor, SfuError> {
        self.request(|respond_to| RoomMessage::CreateTransport {
            participant_id,
            respond_to,
        })
        .await?
    }

    pub async fn connect_transport(
        &self,
        participant_id: String,
        transport_id: String,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::ConnectTransport {
            participant_id,
            transport_id,
            dtls_parameters,
            respond_to,
        })
        .await?
    }

    /// Publish a track on a connected transport. Other members receive
    /// `new-producer`.
    pub async fn produce(
        &self,
        participant_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, SfuError> {
        self.request(|respond_to| RoomMessage::Produce {
            participant_id,
            transport_id,
            kind,
            rtp_parameters,
            respond_to,
        })
        .await?
    }

    /// Subscribe to a producer. The consumer starts paused.
    pub async fn consume(
        &self,
        participant_id: String,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeOutcome, SfuError> {
        self.request(|respond_to| RoomMessage::Consume {
            participant_id,
            transport_id,
            producer_id,
            rtp_capabilities,
            respond_to,
        })
        .await?
    }

    pub async fn resume_consumer(
        &self,
        participant_id: String,
        consumer_id: String,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::ResumeConsumer {
            participant_id,
            consumer_id,
            respond_to,
        })
        .await?
    }

    pub async fn pause_producer(
        &self,
        participant_id: String,
        producer_id: String,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::PauseProducer {
            participant_id,
            producer_id,
            respond_to,
        })
        .await?
    }

    pub async fn resume_producer(
        &self,
        participant_id: String,
        producer_id: String,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::ResumeProducer {
            participant_id,
            producer_id,
            respond_to,
        })
        .await?
    }

    pub async fn close_producer(
        &self,
        participant_id: String,
        producer_id: String,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::CloseProducer {
            participant_id,
            producer_id,
            respond_to,
        })
        .await?
    }

    /// Producers of every member except `excluding`.
    pub async fn list_remote_producers(
        &self,
        excluding: String,
    ) -> Result<Vec<RemoteProducer>, SfuError> {
        self.request(|respond_to| RoomMessage::ListRemoteProducers {
            excluding,
            respond_to,
        })
        .await
    }

    /// Send `event` to every member except `from`.
    pub async fn broadcast(&self, from: Option<String>, event: RoomEvent) -> Result<(), SfuError> {
        self.sender
            .send(RoomMessage::Broadcast { from, event })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        self.request(|respond_to| RoomMessage::GetState { respond_to })
            .await
    }

    /// Close the room: members receive `room-closed`, every resource and the
    /// router are closed, and the actor stops.
    pub async fn close(&self) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::Close { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// True once the actor stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

struct Member {
    connection_id: String,
    /// Distinguishes this membership from a later one with the same id.
    epoch: u64,
    events: mpsc::Sender<RoomEvent>,
    graph: ResourceGraph,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    meeting_id: String,
    router: RouterInfo,
    gateway: MediaEngineGateway,
    transport_options: Arc<TransportOptions>,
    receiver: mpsc::Receiver<RoomMessage>,
    /// For completions of spawned engine calls; does not keep the room alive.
    completions: mpsc::WeakSender<RoomMessage>,
    cancel_token: CancellationToken,
    members: HashMap<String, Member>,
    next_epoch: u64,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room actor on an already created router.
    pub fn spawn(
        meeting_id: String,
        router: RouterInfo,
        gateway: MediaEngineGateway,
        transport_options: Arc<TransportOptions>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let handle = RoomHandle {
            sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            meeting_id: meeting_id.clone(),
            router_id: router.id.clone(),
            worker_id: router.worker_id,
            rtp_capabilities: Arc::new(router.rtp_capabilities.clone()),
        };

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Room, &meeting_id),
            meeting_id,
            router,
            gateway,
            transport_options,
            receiver,
            completions: sender.downgrade(),
            cancel_token,
            members: HashMap::new(),
            next_epoch: 1,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.actor.room", fields(meeting_id = %self.meeting_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.room",
            meeting_id = %self.meeting_id,
            router_id = %self.router.id,
            worker_id = self.router.worker_id,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.room",
                        meeting_id = %self.meeting_id,
                        "RoomActor received cancellation signal"
                    );
                    self.close_room().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            let flow = self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            if flow.is_break() {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "sfu.actor.room",
                                meeting_id = %self.meeting_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.close_room().await;
                            break;
                        }
                    }
                }
            }
        }

        self.drain_after_close().await;

        info!(
            target: "sfu.actor.room",
            meeting_id = %self.meeting_id,
            messages_processed = self.mailbox.messages_processed(),
            events_dropped = self.mailbox.messages_dropped(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) -> ControlFlow<()> {
        match message {
            RoomMessage::AddParticipant {
                participant_id,
                connection_id,
                events,
                respond_to,
            } => {
                let result = self.add_participant(participant_id, connection_id, events);
                let _ = respond_to.send(result);
            }

            RoomMessage::RebindParticipant {
                participant_id,
                connection_id,
                events,
                respond_to,
            } => {
                let result = self.rebind_participant(&participant_id, connection_id, events);
                let _ = respond_to.send(result);
            }

            RoomMessage::RemoveParticipant {
                participant_id,
                connection_id,
                respond_to,
            } => {
                self.remove_participant(participant_id, connection_id, respond_to);
            }

            RoomMessage::CreateTransport {
                participant_id,
                respond_to,
            } => {
                self.create_transport(participant_id, respond_to);
            }

            RoomMessage::ConnectTransport {
                participant_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                self.connect_transport(participant_id, transport_id, dtls_parameters, respond_to);
            }

            RoomMessage::Produce {
                participant_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                self.produce(participant_id, transport_id, kind, rtp_parameters, respond_to);
            }

            RoomMessage::Consume {
                participant_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => {
                self.consume(
                    participant_id,
                    transport_id,
                    producer_id,
                    rtp_capabilities,
                    respond_to,
                );
            }

            RoomMessage::ResumeConsumer {
                participant_id,
                consumer_id,
                respond_to,
            } => {
                let result = self.resume_consumer(&participant_id, &consumer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::PauseProducer {
                participant_id,
                producer_id,
                respond_to,
            } => {
                let result = self
                    .set_producer_paused(&participant_id, &producer_id, true)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ResumeProducer {
                participant_id,
                producer_id,
                respond_to,
            } => {
                let result = self
                    .set_producer_paused(&participant_id, &producer_id, false)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::CloseProducer {
                participant_id,
                producer_id,
                respond_to,
            } => {
                let result = self.close_producer(&participant_id, &producer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ListRemoteProducers {
                excluding,
                respond_to,
            } => {
                let _ = respond_to.send(self.list_remote_producers(&excluding));
            }

            RoomMessage::Broadcast { from, event } => {
                self.broadcast(from.as_deref(), &event);
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }

            RoomMessage::Close { respond_to } => {
                self.close_room().await;
                let _ = respond_to.send(());
                return ControlFlow::Break(());
            }

            RoomMessage::TransportCreated {
                participant_id,
                epoch,
                result,
                respond_to,
            } => {
                let result = self.commit_transport(&participant_id, epoch, result);
                let _ = respond_to.send(result);
            }

            RoomMessage::TransportConnected {
                participant_id,
                epoch,
                transport_id,
                result,
                respond_to,
            } => {
                let result = self.commit_connect(&participant_id, epoch, &transport_id, result);
                let _ = respond_to.send(result);
            }

            RoomMessage::Produced {
                participant_id,
                epoch,
                transport_id,
                kind,
                result,
                respond_to,
            } => {
                let result = self.commit_producer(&participant_id, epoch, transport_id, kind, result);
                let _ = respond_to.send(result);
            }

            RoomMessage::Consumed {
                participant_id,
                epoch,
                transport_id,
                producer_id,
                producer_owner,
                result,
                respond_to,
            } => {
                let result = self.commit_consumer(
                    &participant_id,
                    epoch,
                    transport_id,
                    &producer_id,
                    producer_owner,
                    result,
                );
                let _ = respond_to.send(result);
            }
        }

        ControlFlow::Continue(())
    }

    fn member(&self, participant_id: &str) -> Result<&Member, SfuError> {
        self.members.get(participant_id).ok_or(SfuError::NotAMember)
    }

    /// The member, if it is still the membership that issued `epoch`.
    fn member_at(&mut self, participant_id: &str, epoch: u64) -> Option<&mut Member> {
        self.members
            .get_mut(participant_id)
            .filter(|m| m.epoch == epoch)
    }

    fn add_participant(
        &mut self,
        participant_id: String,
        connection_id: String,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<(), SfuError> {
        if self.members.contains_key(&participant_id) {
            return Err(SfuError::AlreadyMember);
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;

        info!(
            target: "sfu.actor.room",
            meeting_id = %self.meeting_id,
            participant_id = %participant_id,
            connection_id = %connection_id,
            "Participant added"
        );

        self.members.insert(
            participant_id,
            Member {
                connection_id,
                epoch,
                events,
                graph: ResourceGraph::new(),
            },
        );
        self.metrics.participant_joined();
        Ok(())
    }

    fn rebind_participant(
        &mut self,
        participant_id: &str,
        connection_id: String,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<(), SfuError> {
        let member = self
            .members
            .get_mut(participant_id)
            .ok_or(SfuError::NotAMember)?;

        info!(
            target: "sfu.actor.room",
            meeting_id = %self.meeting_id,
            participant_id = %participant_id,
            old_connection_id = %member.connection_id,
            connection_id = %connection_id,
            "Participant rebound to new connection"
        );

        let previous = std::mem::replace(&mut member.events, events);
        if member.connection_id != connection_id {
            // The old connection must stop acting for this participant.
            let _ = previous.try_send(RoomEvent::SessionReplaced {
                participant_id: participant_id.to_string(),
            });
        }
        member.connection_id = connection_id;
        Ok(())
    }

    fn remove_participant(
        &mut self,
        participant_id: String,
        connection_id: Option<String>,
        respond_to: oneshot::Sender<RemovalOutcome>,
    ) {
        let superseded = match (self.members.get(&participant_id), &connection_id) {
            (None, _) => {
                debug!(
                    target: "sfu.actor.room",
                    meeting_id = %self.meeting_id,
                    participant_id = %participant_id,
                    "Remove for absent participant ignored"
                );
                let _ = respond_to.send(RemovalOutcome::NotPresent);
                return;
            }
            (Some(member), Some(conn)) => member.connection_id != *conn,
            (Some(_), None) => false,
        };
        if superseded {
            debug!(
                target: "sfu.actor.room",
                meeting_id = %self.meeting_id,
                participant_id = %participant_id,
                "Remove from stale connection ignored"
            );
            let _ = respond_to.send(RemovalOutcome::Superseded);
            return;
        }

        let Some(member) = self.members.remove(&participant_id) else {
            let _ = respond_to.send(RemovalOutcome::NotPresent);
            return;
        };
        self.metrics.participant_left();

        let producer_ids: Vec<String> = member.graph.producers().map(|p| p.id.clone()).collect();
        for producer_id in producer_ids {
            self.drop_remote_consumers(&producer_id);
            self.broadcast(
                None,
                &RoomEvent::ProducerClosed {
                    participant_id: participant_id.clone(),
                    producer_id,
                },
            );
        }

        info!(
            target: "sfu.actor.room",
            meeting_id = %self.meeting_id,
            participant_id = %participant_id,
            transports = member.graph.transport_count(),
            producers = member.graph.producer_count(),
            consumers = member.graph.consumer_count(),
            remaining = self.members.len(),
            "Participant removed"
        );

        // The map update above is already visible; engine teardown runs
        // outside the mailbox.
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            member.graph.teardown(&gateway, &participant_id).await;
            let _ = respond_to.send(RemovalOutcome::Removed);
        });
    }

    /// Drop other members' consumers of a producer that is going away.
    fn drop_remote_consumers(&mut self, producer_id: &str) {
        for member in self.members.values_mut() {
            member.graph.drop_consumers_of(producer_id);
        }
    }

    fn create_transport(
        &mut self,
        participant_id: String,
        respond_to: oneshot::Sender<Result<TransportDescriptor, SfuError>>,
    ) {
        let epoch = match self.member(&participant_id) {
            Ok(member) => member.epoch,
            Err(e) => {
                let _ = respond_to.send(Err(e));
                return;
            }
        };

        let gateway = self.gateway.clone();
        let router_id = self.router.id.clone();
        let options = Arc::clone(&self.transport_options);
        let completions = self.completions.clone();
        let meeting_id = self.meeting_id.clone();
        tokio::spawn(async move {
            let result = gateway.create_transport(&router_id, &options).await;
            let message = RoomMessage::TransportCreated {
                participant_id,
                epoch,
                result,
                respond_to,
            };
            deliver_completion(completions, message, &gateway, &meeting_id).await;
        });
    }

    fn commit_transport(
        &mut self,
        participant_id: &str,
        epoch: u64,
        result: Result<TransportDescriptor, EngineError>,
    ) -> Result<TransportDescriptor, SfuError> {
        let descriptor = result.map_err(|e| self.engine_failure("create_transport", participant_id, e))?;

        let Some(member) = self.member_at(participant_id, epoch) else {
            self.release(Released::Transport(descriptor.id));
            return Err(SfuError::NotAMember);
        };
        member.graph.insert_transport(descriptor.id.clone());

        debug!(
            target: "sfu.actor.room",
            meeting_id = %self.meeting_id,
            participant_id = %participant_id,
            transport_id = %descriptor.id,
            "Transport created"
        );
        Ok(descriptor)
    }

    fn connect_transport(
        &mut self,
        participant_id: String,
        transport_id: String,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    ) {
        let epoch = match self.member(&participant_id).and_then(|member| {
            match member.graph.transport(&transport_id) {
                None => Err(SfuError::NotFound(ResourceKind::Transport)),
                Some(t) if t.connected => Err(SfuError::Engine(EngineError::AlreadyConnected(
                    transport_id.clone(),
                ))),
                Some(_) => Ok(member.epoch),
            }
        }) {
            Ok(epoch) => epoch,
            Err(e) => {
                let _ = respond_to.send(Err(e));
                return;
            }
        };

        let gateway = self.gateway.clone();
        let completions = self.completions.clone();
        let meeting_id = self.meeting_id.clone();
        tokio::spawn(async move {
            let result = gateway
                .connect_transport(&transport_id, &dtls_parameters)
                .await;
            let message = RoomMessage::TransportConnected {
                participant_id,
                epoch,
                transport_id,
                result,
                respond_to,
            };
            deliver_completion(completions, message, &gateway, &meeting_id).await;
        });
    }

    fn commit_connect(
        &mut self,
        participant_id: &str,
        epoch: u64,
        transport_id: &str,
        result: Result<(), EngineError>,
    ) -> Result<(), SfuError> {
        result.map_err(|e| self.engine_failure("connect_transport", participant_id, e))?;

        let member = self
            .member_at(participant_id, epoch)
            .ok_or(SfuError::NotAMember)?;
        let transport = member
            .graph
            .transport_mut(transport_id)
            .ok_or(SfuError::NotFound(ResourceKind::Transport))?;
        transport.connected = true;
        Ok(())
    }

    fn produce(
        &mut self,
        participant_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: oneshot::Sender<Result<String, SfuError>>,
    ) {
        let epoch = match self.member(&participant_id).and_then(|member| {
            match member.graph.transport(&transport_id) {
                None => Err(SfuError::NotFound(ResourceKind::Transport)),
                Some(t) if !t.connected => Err(SfuError::InvalidState(
                    "Transport is not connected".to_string(),
                )),
                Some(_) => Ok(member.epoch),
            }
        }) {
            Ok(epoch) => epoch,
            Err(e) => {
                let _ = respond_to.send(Err(e));
                return;
            }
        };

        let gateway = self.gateway.clone();
        let completions = self.completions.clone();
        let meeting_id = self.meeting_id.clone();
        tokio::spawn(async move {
            let result = gateway.produce(&transport_id, kind, &rtp_parameters).await;
            let message = RoomMessage::Produced {
                participant_id,
                epoch,
                transport_id,
                kind,
                result,
                respond_to,
            };
            deliver_completion(completions, message, &gateway, &meeting_id).await;
        });
    }

    fn commit_producer(
        &mut self,
        participant_id: &str,
        epoch: u64,
        transport_id: String,
        kind: MediaKind,
        result: Result<String, EngineError>,
    ) -> Result<String, SfuError> {
        let producer_id = result.map_err(|e| self.engine_failure("produce", participant_id, e))?;

        let inserted = match self.member_at(participant_id, epoch) {
            Some(member) => member.graph.insert_producer(ProducerEntry {
                id: producer_id.clone(),
                transport_id,
                kind,
                paused: false,
            }),
            None => Err(SfuError::NotAMember),
        };
        if let Err(e) = inserted {
            self.release(Released::Producer(producer_id));
            return Err(e);
        }

        info!(
            target: "sfu.actor.room",
            meeting_id = %self.meeting_id,
            participant_id = %participant_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );

        self.broadcast(
            Some(participant_id),
            &RoomEvent::NewProducer {
                participant_id: participant_id.to_string(),
                producer_id: producer_id.clone(),
                kind,
            },
        );
        Ok(producer_id)
    }

    fn consume(
        &mut self,
        participant_id: String,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<ConsumeOutcome, SfuError>>,
    ) {
        let checked = self.member(&participant_id).and_then(|member| {
            if member.graph.transport(&transport_id).is_none() {
                return Err(SfuError::NotFound(ResourceKind::Transport));
            }
            let owner = self
                .members
                .iter()
                .find(|(_, m)| m.graph.producer(&producer_id).is_some())
                .map(|(id, _)| id.clone())
                .ok_or(SfuError::NotFound(ResourceKind::Producer))?;
            Ok((member.epoch, owner))
        });
        let (epoch, producer_owner) = match checked {
            Ok(checked) => checked,
            Err(e) => {
                let _ = respond_to.send(Err(e));
                return;
            }
        };

        let gateway = self.gateway.clone();
        let router_id = self.router.id.clone();
        let completions = self.completions.clone();
        let meeting_id = self.meeting_id.clone();
        tokio::spawn(async move {
            // Every outcome goes back through the room: the producer may be
            // gone by the time the engine answers.
            let result = match gateway
                .can_consume(&router_id, &producer_id, &rtp_capabilities)
                .await
            {
                Ok(true) => gateway
                    .consume(&transport_id, &producer_id, &rtp_capabilities, true)
                    .await
                    .map(Some),
                Ok(false) => Ok(None),
                Err(e) => Err(e),
            };
            let message = RoomMessage::Consumed {
                participant_id,
                epoch,
                transport_id,
                producer_id,
                producer_owner,
                result,
                respond_to,
            };
            deliver_completion(completions, message, &gateway, &meeting_id).await;
        });
    }

    fn commit_consumer(
        &mut self,
        participant_id: &str,
        epoch: u64,
        transport_id: String,
        producer_id: &str,
        producer_owner: String,
        result: Result<Option<ConsumerDescriptor>, EngineError>,
    ) -> Result<ConsumeOutcome, SfuError> {
        // The producer may have been closed while the engine was working.
        // A vanished producer wins over whatever the engine reported.
        let producer_alive = self
            .members
            .get(&producer_owner)
            .is_some_and(|m| m.graph.producer(producer_id).is_some());

        let descriptor = match result {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) if producer_alive => {
                debug!(
                    target: "sfu.actor.room",
                    meeting_id = %self.meeting_id,
                    participant_id = %participant_id,
                    producer_id = %producer_id,
                    "Consumer capabilities incompatible"
                );
                return Ok(ConsumeOutcome::Incompatible);
            }
            Err(e) if producer_alive => return Err(self.engine_failure("consume", participant_id, e)),
            Ok(None) | Err(_) => {
                debug!(
                    target: "sfu.actor.room",
                    meeting_id = %self.meeting_id,
                    participant_id = %participant_id,
                    producer_id = %producer_id,
                    "Producer closed during consume"
                );
                return Err(SfuError::NotFound(ResourceKind::Producer));
            }
        };

        let inserted = if producer_alive {
            match self.member_at(participant_id, epoch) {
                Some(member) => member.graph.insert_consumer(ConsumerEntry {
                    id: descriptor.id.clone(),
                    transport_id,
                    producer_id: descriptor.producer_id.clone(),
                    producer_owner,
                    kind: descriptor.kind,
                    paused: true,
                }),
                None => Err(SfuError::NotAMember),
            }
        } else {
            Err(SfuError::NotFound(ResourceKind::Producer))
        };
        if let Err(e) = inserted {
            self.release(Released::Consumer(descriptor.id));
            return Err(e);
        }

        debug!(
            target: "sfu.actor.room",
            meeting_id = %self.meeting_id,
            participant_id = %participant_id,
            consumer_id = %descriptor.id,
            producer_id = %descriptor.producer_id,
            "Consumer created (paused)"
        );
        Ok(ConsumeOutcome::Consumer(descriptor))
    }

    async fn resume_consumer(
        &mut self,
        participant_id: &str,
        consumer_id: &str,
    ) -> Result<(), SfuError> {
        let member = self
            .members
            .get_mut(participant_id)
            .ok_or(SfuError::NotAMember)?;
        if member.graph.consumer_mut(consumer_id).is_none() {
            return Err(SfuError::NotFound(ResourceKind::Consumer));
        }

        self.gateway
            .resume_consumer(consumer_id)
            .await
            .map_err(|e| self.engine_failure("resume_consumer", participant_id, e))?;

        if let Some(consumer) = self
            .members
            .get_mut(participant_id)
            .and_then(|m| m.graph.consumer_mut(consumer_id))
        {
            consumer.paused = false;
        }
        Ok(())
    }

    async fn set_producer_paused(
        &mut self,
        participant_id: &str,
        producer_id: &str,
        paused: bool,
    ) -> Result<(), SfuError> {
        let member = self.member(participant_id)?;
        if member.graph.producer(producer_id).is_none() {
            return Err(SfuError::NotFound(ResourceKind::Producer));
        }

        let result = if paused {
            self.gateway.pause_producer(producer_id).await
        } else {
            self.gateway.resume_producer(producer_id).await
        };
        let op = if paused { "pause_producer" } else { "resume_producer" };
        result.map_err(|e| self.engine_failure(op, participant_id, e))?;

        if let Some(producer) = self
            .members
            .get_mut(participant_id)
            .and_then(|m| m.graph.producer_mut(producer_id))
        {
            producer.paused = paused;
        }

        let event = if paused {
            RoomEvent::ProducerPaused {
                participant_id: participant_id.to_string(),
                producer_id: producer_id.to_string(),
            }
        } else {
            RoomEvent::ProducerResumed {
                participant_id: participant_id.to_string(),
                producer_id: producer_id.to_string(),
            }
        };
        self.broadcast(Some(participant_id), &event);
        Ok(())
    }

    async fn close_producer(
        &mut self,
        participant_id: &str,
        producer_id: &str,
    ) -> Result<(), SfuError> {
        let member = self.member(participant_id)?;
        if member.graph.producer(producer_id).is_none() {
            return Err(SfuError::NotFound(ResourceKind::Producer));
        }

        // Peers only hear about the close once the engine confirmed it.
        self.gateway
            .close_producer(producer_id)
            .await
            .map_err(|e| self.engine_failure("close_producer", participant_id, e))?;

        if let Some(member) = self.members.get_mut(participant_id) {
            member.graph.remove_producer(producer_id);
        }
        self.drop_remote_consumers(producer_id);
        self.broadcast(
            Some(participant_id),
            &RoomEvent::ProducerClosed {
                participant_id: participant_id.to_string(),
                producer_id: producer_id.to_string(),
            },
        );

        info!(
            target: "sfu.actor.room",
            meeting_id = %self.meeting_id,
            participant_id = %participant_id,
            producer_id = %producer_id,
            "Producer closed"
        );
        Ok(())
    }

    fn list_remote_producers(&self, excluding: &str) -> Vec<RemoteProducer> {
        self.members
            .iter()
            .filter(|(id, _)| id.as_str() != excluding)
            .flat_map(|(id, member)| {
                member.graph.producers().map(move |p| RemoteProducer {
                    participant_id: id.clone(),
                    producer_id: p.id.clone(),
                    kind: p.kind,
                    paused: p.paused,
                })
            })
            .collect()
    }

    fn broadcast(&self, from: Option<&str>, event: &RoomEvent) {
        for (participant_id, member) in &self.members {
            if Some(participant_id.as_str()) == from {
                continue;
            }
            match member.events.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.mailbox.record_drop();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(
                        target: "sfu.actor.room",
                        meeting_id = %self.meeting_id,
                        participant_id = %participant_id,
                        event = event.name(),
                        "Event queue closed, event not delivered"
                    );
                }
            }
        }
    }

    fn get_state(&self) -> RoomState {
        let mut participants: Vec<ParticipantStats> = self
            .members
            .iter()
            .map(|(id, member)| ParticipantStats {
                participant_id: id.clone(),
                transports: member.graph.transport_count(),
                producers: member.graph.producer_count(),
                consumers: member.graph.consumer_count(),
            })
            .collect();
        participants.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));

        RoomState {
            meeting_id: self.meeting_id.clone(),
            router_id: self.router.id.clone(),
            worker_id: self.router.worker_id,
            participants,
        }
    }

    /// Log an engine failure with its context and convert it.
    fn engine_failure(&self, operation: &str, participant_id: &str, error: EngineError) -> SfuError {
        warn!(
            target: "sfu.actor.room",
            meeting_id = %self.meeting_id,
            participant_id = %participant_id,
            operation = operation,
            error = %error,
            "Engine call failed"
        );
        SfuError::Engine(error)
    }

    /// Close an engine resource that was created but could not be committed.
    fn release(&self, resource: Released) {
        debug!(
            target: "sfu.actor.room",
            meeting_id = %self.meeting_id,
            resource = ?resource,
            "Releasing uncommitted engine resource"
        );
        let gateway = self.gateway.clone();
        tokio::spawn(async move { resource.close(&gateway).await });
    }

    /// Tear down every member, then the router.
    async fn close_room(&mut self) {
        info!(
            target: "sfu.actor.room",
            meeting_id = %self.meeting_id,
            participants = self.members.len(),
            "Closing room"
        );

        self.broadcast(
            None,
            &RoomEvent::RoomClosed {
                meeting_id: self.meeting_id.clone(),
            },
        );

        for (participant_id, member) in self.members.drain() {
            member.graph.teardown(&self.gateway, &participant_id).await;
            self.metrics.participant_left();
        }

        if let Err(e) = self.gateway.close_router(&self.router.id).await {
            warn!(
                target: "sfu.actor.room",
                meeting_id = %self.meeting_id,
                router_id = %self.router.id,
                error = %e,
                "Failed to close router"
            );
        }
    }

    /// Release resources of completions that arrived during close. Other
    /// queued requests are dropped, which fails them on the caller side.
    async fn drain_after_close(&mut self) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            release_completion(message, &self.gateway, &self.meeting_id).await;
        }
    }
}

/// Engine resource created for a request that can no longer be committed.
#[derive(Debug)]
enum Released {
    Transport(String),
    Producer(String),
    Consumer(String),
}

impl Released {
    async fn close(self, gateway: &MediaEngineGateway) {
        let result = match &self {
            Released::Transport(id) => gateway.close_transport(id).await,
            Released::Producer(id) => gateway.close_producer(id).await,
            Released::Consumer(id) => gateway.close_consumer(id).await,
        };
        if let Err(e) = result {
            warn!(
                target: "sfu.actor.room",
                resource = ?self,
                error = %e,
                "Failed to release engine resource"
            );
        }
    }
}

/// Send a completion to the room. If the room is gone, close what the engine
/// created and fail the request.
async fn deliver_completion(
    completions: mpsc::WeakSender<RoomMessage>,
    message: RoomMessage,
    gateway: &MediaEngineGateway,
    meeting_id: &str,
) {
    let undelivered = match completions.upgrade() {
        Some(sender) => match sender.send(message).await {
            Ok(()) => return,
            Err(mpsc::error::SendError(message)) => message,
        },
        None => message,
    };
    release_completion(undelivered, gateway, meeting_id).await;
}

async fn release_completion(message: RoomMessage, gateway: &MediaEngineGateway, meeting_id: &str) {
    let closed = || SfuError::RoomNotFound(meeting_id.to_string());
    match message {
        RoomMessage::TransportCreated {
            result, respond_to, ..
        } => {
            if let Ok(descriptor) = &result {
                Released::Transport(descriptor.id.clone()).close(gateway).await;
            }
            let _ = respond_to.send(result.map_err(SfuError::from).and_then(|_| Err(closed())));
        }
        RoomMessage::TransportConnected {
            result, respond_to, ..
        } => {
            let _ = respond_to.send(result.map_err(SfuError::from).and_then(|()| Err(closed())));
        }
        RoomMessage::Produced {
            result, respond_to, ..
        } => {
            if let Ok(producer_id) = &result {
                Released::Producer(producer_id.clone()).close(gateway).await;
            }
            let _ = respond_to.send(result.map_err(SfuError::from).and_then(|_| Err(closed())));
        }
        RoomMessage::Consumed {
            result, respond_to, ..
        } => {
            if let Ok(Some(descriptor)) = &result {
                Released::Consumer(descriptor.id.clone()).close(gateway).await;
            }
            let _ = respond_to.send(result.map_err(SfuError::from).and_then(|_| Err(closed())));
        }
        _ => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::default_media_codecs;
    use crate::engine::{
        DtlsFingerprint, DtlsRole, EngineOp, LoopbackEngine, MediaEngine, RtpCodecParameters,
        WorkerSettings,
    };
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Fixture {
        engine: Arc<LoopbackEngine>,
        room: RoomHandle,
        task: JoinHandle<()>,
        metrics: Arc<ActorMetrics>,
    }

    async fn fixture() -> Fixture {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = MediaEngineGateway::new(engine.clone());
        let worker_id = engine
            .create_worker(&WorkerSettings {
                rtc_min_port: 40000,
                rtc_max_port: 40100,
                log_level: "warn".to_string(),
            })
            .await
            .unwrap();
        let router = gateway
            .create_router(worker_id, &default_media_codecs())
            .await
            .unwrap();
        let metrics = ActorMetrics::new();
        let (room, task) = RoomActor::spawn(
            "meeting-1".to_string(),
            router,
            gateway,
            Arc::new(TransportOptions::default()),
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        Fixture {
            engine,
            room,
            task,
            metrics,
        }
    }

    fn events() -> (mpsc::Sender<RoomEvent>, mpsc::Receiver<RoomEvent>) {
        mpsc::channel(32)
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: Some(DtlsRole::Client),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    fn vp8() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 101,
                clock_rate: 90000,
                channels: None,
                parameters: BTreeMap::new(),
                rtcp_feedback: Vec::new(),
            }],
            ..Default::default()
        }
    }

    async fn join(room: &RoomHandle, id: &str) -> mpsc::Receiver<RoomEvent> {
        let (tx, rx) = events();
        room.add_participant(id.to_string(), format!("conn-{id}"), tx)
            .await
            .unwrap();
        rx
    }

    /// Create and connect a transport, then produce VP8 on it.
    async fn publish(room: &RoomHandle, id: &str) -> (String, String) {
        let transport = room.create_transport(id.to_string()).await.unwrap();
        room.connect_transport(id.to_string(), transport.id.clone(), dtls())
            .await
            .unwrap();
        let producer_id = room
            .produce(id.to_string(), transport.id.clone(), MediaKind::Video, vp8())
            .await
            .unwrap();
        (transport.id, producer_id)
    }

    #[tokio::test]
    async fn test_add_participant_rejects_duplicate() {
        let f = fixture().await;
        let _rx = join(&f.room, "alice").await;

        let (tx, _rx2) = events();
        let result = f
            .room
            .add_participant("alice".to_string(), "conn-2".to_string(), tx)
            .await;
        assert_eq!(result, Err(SfuError::AlreadyMember));
        assert_eq!(f.metrics.participant_count(), 1);
    }

    #[tokio::test]
    async fn test_operations_require_membership() {
        let f = fixture().await;
        assert_eq!(
            f.room.create_transport("ghost".to_string()).await,
            Err(SfuError::NotAMember)
        );
        assert_eq!(
            f.room
                .pause_producer("ghost".to_string(), "p".to_string())
                .await,
            Err(SfuError::NotAMember)
        );
    }

    #[tokio::test]
    async fn test_connect_unknown_transport_not_found() {
        let f = fixture().await;
        let _rx = join(&f.room, "alice").await;
        let result = f
            .room
            .connect_transport("alice".to_string(), "nope".to_string(), dtls())
            .await;
        assert_eq!(result, Err(SfuError::NotFound(ResourceKind::Transport)));
    }

    #[tokio::test]
    async fn test_produce_requires_connected_transport() {
        let f = fixture().await;
        let _rx = join(&f.room, "alice").await;
        let transport = f.room.create_transport("alice".to_string()).await.unwrap();

        let result = f
            .room
            .produce("alice".to_string(), transport.id, MediaKind::Video, vp8())
            .await;
        assert!(matches!(result, Err(SfuError::InvalidState(_))));
        assert_eq!(f.engine.call_count(EngineOp::Produce), 0);
    }

    #[tokio::test]
    async fn test_new_producer_fanned_out_to_others_only() {
        let f = fixture().await;
        let mut alice_rx = join(&f.room, "alice").await;
        let mut bob_rx = join(&f.room, "bob").await;

        let (_, producer_id) = publish(&f.room, "alice").await;

        let event = bob_rx.recv().await.unwrap();
        assert_eq!(
            event,
            RoomEvent::NewProducer {
                participant_id: "alice".to_string(),
                producer_id,
                kind: MediaKind::Video,
            }
        );
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_engine_error_during_produce_leaves_nothing_registered() {
        let f = fixture().await;
        let _rx = join(&f.room, "alice").await;
        let transport = f.room.create_transport("alice".to_string()).await.unwrap();
        f.room
            .connect_transport("alice".to_string(), transport.id.clone(), dtls())
            .await
            .unwrap();

        f.engine
            .fail_next(EngineOp::Produce, EngineError::Rejected("boom".to_string()));
        let result = f
            .room
            .produce("alice".to_string(), transport.id, MediaKind::Video, vp8())
            .await;

        assert!(matches!(result, Err(SfuError::Engine(_))));
        let state = f.room.get_state().await.unwrap();
        assert_eq!(state.participants.first().unwrap().producers, 0);
    }

    #[tokio::test]
    async fn test_remove_mid_create_transport_releases_engine_resource() {
        let f = fixture().await;
        let _rx = join(&f.room, "alice").await;
        f.engine.set_latency(Duration::from_millis(50));

        let room = f.room.clone();
        let pending = tokio::spawn(async move { room.create_transport("alice".to_string()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = f
            .room
            .remove_participant("alice".to_string(), None)
            .await
            .unwrap();
        assert_eq!(outcome, RemovalOutcome::Removed);

        assert_eq!(pending.await.unwrap(), Err(SfuError::NotAMember));
        // Release runs in its own task and still sees the engine latency.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.engine.resource_counts().transports, 0);
    }

    #[tokio::test]
    async fn test_consume_incompatible_creates_nothing() {
        let f = fixture().await;
        let _a = join(&f.room, "alice").await;
        let _b = join(&f.room, "bob").await;
        let (_, producer_id) = publish(&f.room, "alice").await;
        let bob_transport = f.room.create_transport("bob".to_string()).await.unwrap();

        let outcome = f
            .room
            .consume(
                "bob".to_string(),
                bob_transport.id,
                producer_id,
                RtpCapabilities::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, ConsumeOutcome::Incompatible);
        assert_eq!(f.engine.call_count(EngineOp::Consume), 0);
    }

    #[tokio::test]
    async fn test_consumer_created_paused_until_resumed() {
        let f = fixture().await;
        let _a = join(&f.room, "alice").await;
        let _b = join(&f.room, "bob").await;
        let (_, producer_id) = publish(&f.room, "alice").await;
        let bob_transport = f.room.create_transport("bob".to_string()).await.unwrap();

        let outcome = f
            .room
            .consume(
                "bob".to_string(),
                bob_transport.id,
                producer_id,
                f.room.rtp_capabilities().clone(),
            )
            .await
            .unwrap();
        let ConsumeOutcome::Consumer(consumer) = outcome else {
            panic!("expected consumer");
        };
        assert!(consumer.paused);
        assert!(!f.engine.is_flowing(&consumer.id));

        f.room
            .resume_consumer("bob".to_string(), consumer.id.clone())
            .await
            .unwrap();
        assert!(f.engine.is_flowing(&consumer.id));
    }

    #[tokio::test]
    async fn test_resume_foreign_consumer_rejected() {
        let f = fixture().await;
        let _a = join(&f.room, "alice").await;
        let _b = join(&f.room, "bob").await;
        let (_, producer_id) = publish(&f.room, "alice").await;
        let bob_transport = f.room.create_transport("bob".to_string()).await.unwrap();
        let ConsumeOutcome::Consumer(consumer) = f
            .room
            .consume(
                "bob".to_string(),
                bob_transport.id,
                producer_id,
                f.room.rtp_capabilities().clone(),
            )
            .await
            .unwrap()
        else {
            panic!("expected consumer");
        };

        let result = f
            .room
            .resume_consumer("alice".to_string(), consumer.id)
            .await;
        assert_eq!(result, Err(SfuError::NotFound(ResourceKind::Consumer)));
    }

    #[tokio::test]
    async fn test_close_producer_removes_it_and_notifies() {
        let f = fixture().await;
        let _a = join(&f.room, "alice").await;
        let mut bob_rx = join(&f.room, "bob").await;
        let (_, producer_id) = publish(&f.room, "alice").await;
        let _new_producer = bob_rx.recv().await.unwrap();

        f.room
            .close_producer("alice".to_string(), producer_id.clone())
            .await
            .unwrap();

        assert!(f
            .room
            .list_remote_producers("bob".to_string())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            bob_rx.recv().await.unwrap(),
            RoomEvent::ProducerClosed {
                participant_id: "alice".to_string(),
                producer_id: producer_id.clone(),
            }
        );
        assert_eq!(
            f.room
                .close_producer("alice".to_string(), producer_id)
                .await,
            Err(SfuError::NotFound(ResourceKind::Producer))
        );
    }

    #[tokio::test]
    async fn test_failed_close_producer_keeps_it_and_tells_no_one() {
        let f = fixture().await;
        let _a = join(&f.room, "alice").await;
        let mut bob_rx = join(&f.room, "bob").await;
        let (_, producer_id) = publish(&f.room, "alice").await;
        let _new_producer = bob_rx.recv().await.unwrap();

        f.engine
            .fail_next(EngineOp::CloseProducer, EngineError::Unavailable);
        let result = f
            .room
            .close_producer("alice".to_string(), producer_id.clone())
            .await;

        assert_eq!(result, Err(SfuError::Engine(EngineError::Unavailable)));
        assert!(bob_rx.try_recv().is_err(), "peer notified of a failed close");
        assert!(f.engine.producer_exists(&producer_id));
        assert_eq!(
            f.room
                .list_remote_producers("bob".to_string())
                .await
                .unwrap()
                .len(),
            1
        );

        // Still owned, so a retry can close it.
        f.room
            .close_producer("alice".to_string(), producer_id.clone())
            .await
            .unwrap();
        assert!(!f.engine.producer_exists(&producer_id));
        assert!(matches!(
            bob_rx.recv().await.unwrap(),
            RoomEvent::ProducerClosed { .. }
        ));
    }

    #[tokio::test]
    async fn test_consume_while_owner_is_removed_reports_missing_producer() {
        let f = fixture().await;
        let _a = join(&f.room, "alice").await;
        let _b = join(&f.room, "bob").await;
        let (_, producer_id) = publish(&f.room, "alice").await;
        let bob_transport = f.room.create_transport("bob".to_string()).await.unwrap();
        f.engine.set_latency(Duration::from_millis(50));

        let room = f.room.clone();
        let capabilities = f.room.rtp_capabilities().clone();
        let pending = tokio::spawn(async move {
            room.consume("bob".to_string(), bob_transport.id, producer_id, capabilities)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.room
            .remove_participant("alice".to_string(), None)
            .await
            .unwrap();

        assert_eq!(
            pending.await.unwrap(),
            Err(SfuError::NotFound(ResourceKind::Producer))
        );
        let state = f.room.get_state().await.unwrap();
        assert_eq!(state.participants.first().unwrap().consumers, 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.engine.resource_counts().consumers, 0);
    }

    #[tokio::test]
    async fn test_incompatible_check_for_vanished_producer_is_not_found() {
        let f = fixture().await;
        let _a = join(&f.room, "alice").await;
        let _b = join(&f.room, "bob").await;
        let (_, producer_id) = publish(&f.room, "alice").await;
        let bob_transport = f.room.create_transport("bob".to_string()).await.unwrap();
        f.engine.set_latency(Duration::from_millis(50));

        // Capabilities that cannot decode VP8: the engine answers "no", but
        // the producer is gone by then.
        let room = f.room.clone();
        let pending = tokio::spawn(async move {
            room.consume(
                "bob".to_string(),
                bob_transport.id,
                producer_id,
                RtpCapabilities::default(),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.room
            .remove_participant("alice".to_string(), None)
            .await
            .unwrap();

        assert_eq!(
            pending.await.unwrap(),
            Err(SfuError::NotFound(ResourceKind::Producer))
        );
    }

    #[tokio::test]
    async fn test_remove_participant_idempotent_and_ordered() {
        let f = fixture().await;
        let _a = join(&f.room, "alice").await;
        let (transport_id, producer_id) = publish(&f.room, "alice").await;

        let first = f
            .room
            .remove_participant("alice".to_string(), None)
            .await
            .unwrap();
        let second = f
            .room
            .remove_participant("alice".to_string(), None)
            .await
            .unwrap();

        assert_eq!(first, RemovalOutcome::Removed);
        assert_eq!(second, RemovalOutcome::NotPresent);
        assert_eq!(f.engine.close_count(&producer_id), 1);
        assert_eq!(f.engine.close_count(&transport_id), 1);
        assert_eq!(f.metrics.participant_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_connection_remove_is_superseded() {
        let f = fixture().await;
        let mut old = join(&f.room, "alice").await;
        let (tx, mut new) = events();
        f.room
            .rebind_participant("alice".to_string(), "conn-new".to_string(), tx)
            .await
            .unwrap();

        assert_eq!(
            old.try_recv().unwrap(),
            RoomEvent::SessionReplaced {
                participant_id: "alice".to_string()
            }
        );
        assert!(new.try_recv().is_err());

        let outcome = f
            .room
            .remove_participant("alice".to_string(), Some("conn-alice".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome, RemovalOutcome::Superseded);
        assert_eq!(f.room.get_state().await.unwrap().participants.len(), 1);
    }

    #[tokio::test]
    async fn test_owner_removal_drops_remote_consumers() {
        let f = fixture().await;
        let _a = join(&f.room, "alice").await;
        let _b = join(&f.room, "bob").await;
        let (_, producer_id) = publish(&f.room, "alice").await;
        let bob_transport = f.room.create_transport("bob".to_string()).await.unwrap();
        f.room
            .consume(
                "bob".to_string(),
                bob_transport.id,
                producer_id,
                f.room.rtp_capabilities().clone(),
            )
            .await
            .unwrap();

        f.room
            .remove_participant("alice".to_string(), None)
            .await
            .unwrap();

        let state = f.room.get_state().await.unwrap();
        let bob = state.participants.first().unwrap();
        assert_eq!(bob.participant_id, "bob");
        assert_eq!(bob.consumers, 0);
    }

    #[tokio::test]
    async fn test_close_tears_down_and_notifies_members() {
        let f = fixture().await;
        let mut alice_rx = join(&f.room, "alice").await;
        publish(&f.room, "alice").await;

        f.room.close().await.unwrap();
        f.task.await.unwrap();

        assert_eq!(
            alice_rx.recv().await.unwrap(),
            RoomEvent::RoomClosed {
                meeting_id: "meeting-1".to_string(),
            }
        );
        assert_eq!(f.engine.resource_counts().routers, 0);
        assert_eq!(f.engine.resource_counts().transports, 0);
        assert!(f.room.is_closed());
    }

    #[tokio::test]
    async fn test_cancellation_closes_router() {
        let f = fixture().await;
        let router_id = f.room.router_id().to_string();
        f.room.cancel();
        f.task.await.unwrap();
        assert!(!f.engine.router_exists(&router_id));
    }

    #[tokio::test]
    async fn test_full_event_queue_does_not_block_room() {
        let f = fixture().await;
        let _a = join(&f.room, "alice").await;
        let (tx, mut bob_rx) = mpsc::channel(1);
        f.room
            .add_participant("bob".to_string(), "conn-bob".to_string(), tx)
            .await
            .unwrap();

        for i in 0..3 {
            f.room
                .broadcast(
                    Some("alice".to_string()),
                    RoomEvent::ParticipantLeft {
                        participant_id: format!("p{i}"),
                    },
                )
                .await
                .unwrap();
        }
        // Broadcast has no reply; a request after it observes its effect.
        f.room.get_state().await.unwrap();

        assert_eq!(
            bob_rx.try_recv().unwrap(),
            RoomEvent::ParticipantLeft {
                participant_id: "p0".to_string(),
            }
        );
        assert!(bob_rx.try_recv().is_err());
    }
}
