//! Message types for actor communication.
//!
//! Requests carry a `oneshot` reply channel. Messages marked internal are
//! sent by tasks the actor spawned itself, to commit the result of an engine
//! call back into actor-owned state.

use crate::directory::{ParticipantRecord, ParticipantUpdates};
use crate::engine::{
    ConsumerDescriptor, DtlsParameters, MediaKind, RouterInfo, RtpCapabilities, RtpParameters,
    TransportDescriptor, WorkerId,
};
use crate::errors::{EngineError, SfuError};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::room::RoomHandle;

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Return the room for the meeting, creating it if needed.
    GetOrCreate {
        meeting_id: String,
        respond_to: oneshot::Sender<Result<RoomHandle, SfuError>>,
    },

    Get {
        meeting_id: String,
        respond_to: oneshot::Sender<Option<RoomHandle>>,
    },

    /// Close and deregister a room.
    Remove {
        meeting_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    List {
        respond_to: oneshot::Sender<Vec<String>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms and close every room.
    Shutdown {
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Internal: router creation for a pending room finished.
    RoomCreated {
        meeting_id: String,
        result: Result<RouterInfo, SfuError>,
    },
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    AddParticipant {
        participant_id: String,
        connection_id: String,
        events: mpsc::Sender<RoomEvent>,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Attach an existing member to a new connection (reconnect).
    RebindParticipant {
        participant_id: String,
        connection_id: String,
        events: mpsc::Sender<RoomEvent>,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Tear down a participant. With `connection_id` set, only a member bound
    /// to that connection is removed.
    RemoveParticipant {
        participant_id: String,
        connection_id: Option<String>,
        respond_to: oneshot::Sender<RemovalOutcome>,
    },

    CreateTransport {
        participant_id: String,
        respond_to: oneshot::Sender<Result<TransportDescriptor, SfuError>>,
    },

    ConnectTransport {
        participant_id: String,
        transport_id: String,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    Produce {
        participant_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: oneshot::Sender<Result<String, SfuError>>,
    },

    Consume {
        participant_id: String,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<ConsumeOutcome, SfuError>>,
    },

    ResumeConsumer {
        participant_id: String,
        consumer_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    PauseProducer {
        participant_id: String,
        producer_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    ResumeProducer {
        participant_id: String,
        producer_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    CloseProducer {
        participant_id: String,
        producer_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    ListRemoteProducers {
        excluding: String,
        respond_to: oneshot::Sender<Vec<RemoteProducer>>,
    },

    /// Fan an event out to every member except `from`.
    Broadcast {
        from: Option<String>,
        event: RoomEvent,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },

    /// Tear down every participant, close the router and stop.
    Close {
        respond_to: oneshot::Sender<()>,
    },

    /// Internal: engine transport creation finished.
    TransportCreated {
        participant_id: String,
        epoch: u64,
        result: Result<TransportDescriptor, EngineError>,
        respond_to: oneshot::Sender<Result<TransportDescriptor, SfuError>>,
    },

    /// Internal: engine transport connect finished.
    TransportConnected {
        participant_id: String,
        epoch: u64,
        transport_id: String,
        result: Result<(), EngineError>,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Internal: engine produce finished.
    Produced {
        participant_id: String,
        epoch: u64,
        transport_id: String,
        kind: MediaKind,
        result: Result<String, EngineError>,
        respond_to: oneshot::Sender<Result<String, SfuError>>,
    },

    /// Internal: engine consume finished. `Ok(None)` means the router
    /// reported the capabilities incompatible.
    Consumed {
        participant_id: String,
        epoch: u64,
        transport_id: String,
        producer_id: String,
        producer_owner: String,
        result: Result<Option<ConsumerDescriptor>, EngineError>,
        respond_to: oneshot::Sender<Result<ConsumeOutcome, SfuError>>,
    },
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// A text frame received from the client.
    Inbound { text: String },

    /// The socket closed; run disconnect teardown and stop.
    Close { reason: String },
}

/// Events fanned out by a room to its members.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RoomEvent {
    ParticipantJoined {
        participant: ParticipantRecord,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { participant_id: String },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        participant_id: String,
        producer_id: String,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ProducerPaused {
        participant_id: String,
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ProducerResumed {
        participant_id: String,
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        participant_id: String,
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantUpdated {
        participant_id: String,
        updates: ParticipantUpdates,
    },
    /// The room was closed; members are no longer joined.
    #[serde(rename_all = "camelCase")]
    RoomClosed { meeting_id: String },
    /// Sent only to the previous connection of a participant that joined
    /// again from a new one.
    #[serde(rename_all = "camelCase")]
    SessionReplaced { participant_id: String },
}

impl RoomEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            RoomEvent::ParticipantJoined { .. } => "participant-joined",
            RoomEvent::ParticipantLeft { .. } => "participant-left",
            RoomEvent::NewProducer { .. } => "new-producer",
            RoomEvent::ProducerPaused { .. } => "producer-paused",
            RoomEvent::ProducerResumed { .. } => "producer-resumed",
            RoomEvent::ProducerClosed { .. } => "producer-closed",
            RoomEvent::ParticipantUpdated { .. } => "participant-updated",
            RoomEvent::RoomClosed { .. } => "room-closed",
            RoomEvent::SessionReplaced { .. } => "session-replaced",
        }
    }
}

/// A producer published by another participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProducer {
    pub participant_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub paused: bool,
}

/// Result of a consume request.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    Consumer(ConsumerDescriptor),
    /// The caller's capabilities cannot decode the producer. Nothing was
    /// created.
    Incompatible,
}

/// Result of a remove request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// The participant was removed and its resources closed.
    Removed,
    /// No such participant; nothing was done.
    NotPresent,
    /// The participant is bound to a newer connection and was kept.
    Superseded,
}

/// Resource counts for one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantStats {
    pub participant_id: String,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

/// Snapshot of a room (for debugging/health).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub meeting_id: String,
    pub router_id: String,
    pub worker_id: WorkerId,
    pub participants: Vec<ParticipantStats>,
}

/// Registry status (for health checks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatus {
    pub room_count: usize,
    /// Rooms whose router is still being created.
    pub creating: usize,
    pub is_draining: bool,
    /// Messages still queued behind the status request.
    pub mailbox_depth: usize,
}
