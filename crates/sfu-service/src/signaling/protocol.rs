//! Signaling wire format.
//!
//! Requests arrive as `{"id": n, "type": "<message>", "data": {...}}` and get
//! exactly one reply echoing `id`:
//!
//! ```text
//! {"id": 7, "success": true, "data": {...}}
//! {"id": 7, "success": false, "error": {"code": "NOT_FOUND", "message": "..."}}
//! ```
//!
//! Room events are sent unsolicited as `{"event": "<name>", "data": {...}}`
//! (see [`crate::actors::RoomEvent`]).

use crate::actors::messages::RemoteProducer;
use crate::directory::{MeetingRecord, ParticipantRecord, ParticipantUpdates};
use crate::engine::{
    ConsumerDescriptor, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters,
    TransportDescriptor,
};
use crate::errors::{ErrorCode, SfuError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw inbound frame before the payload is interpreted.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub id: Value,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    #[serde(alias = "receive")]
    Recv,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMeetingRequest {
    pub meeting_id: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CreateTransportRequest {
    #[serde(default)]
    pub direction: Option<TransportDirection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: String,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub transport_id: String,
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerTarget {
    pub consumer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerTarget {
    pub producer_id: String,
}

/// A decoded signaling request.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingRequest {
    JoinMeeting(JoinMeetingRequest),
    CreateTransport(CreateTransportRequest),
    ConnectTransport(ConnectTransportRequest),
    Produce(ProduceRequest),
    Consume(ConsumeRequest),
    ResumeConsumer(ConsumerTarget),
    PauseProducer(ProducerTarget),
    ResumeProducer(ProducerTarget),
    CloseProducer(ProducerTarget),
    ToggleMute,
    ToggleVideo,
    ToggleHand,
    StartScreenShare,
    StopScreenShare,
    LeaveMeeting,
}

impl SignalingRequest {
    /// Wire name of the request, also used as the metrics label.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            SignalingRequest::JoinMeeting(_) => "join-meeting",
            SignalingRequest::CreateTransport(_) => "create-transport",
            SignalingRequest::ConnectTransport(_) => "connect-transport",
            SignalingRequest::Produce(_) => "produce",
            SignalingRequest::Consume(_) => "consume",
            SignalingRequest::ResumeConsumer(_) => "resume-consumer",
            SignalingRequest::PauseProducer(_) => "pause-producer",
            SignalingRequest::ResumeProducer(_) => "resume-producer",
            SignalingRequest::CloseProducer(_) => "close-producer",
            SignalingRequest::ToggleMute => "toggle-mute",
            SignalingRequest::ToggleVideo => "toggle-video",
            SignalingRequest::ToggleHand => "toggle-hand",
            SignalingRequest::StartScreenShare => "start-screen-share",
            SignalingRequest::StopScreenShare => "stop-screen-share",
            SignalingRequest::LeaveMeeting => "leave-meeting",
        }
    }
}

/// Every request type the server accepts.
pub const REQUEST_TYPES: [&str; 15] = [
    "join-meeting",
    "create-transport",
    "connect-transport",
    "produce",
    "consume",
    "resume-consumer",
    "pause-producer",
    "resume-producer",
    "close-producer",
    "toggle-mute",
    "toggle-video",
    "toggle-hand",
    "start-screen-share",
    "stop-screen-share",
    "leave-meeting",
];

impl ClientFrame {
    /// The frame's `type` if the server accepts it, without looking at the
    /// payload.
    #[must_use]
    pub fn known_type(&self) -> Option<&'static str> {
        REQUEST_TYPES
            .iter()
            .copied()
            .find(|known| *known == self.message_type)
    }

    /// Interpret the payload according to `type`.
    ///
    /// # Errors
    ///
    /// `SfuError::InvalidRequest` for an unknown type or a payload that does
    /// not match it.
    pub fn into_request(self) -> Result<SignalingRequest, SfuError> {
        let ClientFrame {
            message_type, data, ..
        } = self;

        let request = match message_type.as_str() {
            "join-meeting" => SignalingRequest::JoinMeeting(payload(&message_type, data)?),
            "create-transport" => {
                let request = if data.is_null() {
                    CreateTransportRequest::default()
                } else {
                    payload(&message_type, data)?
                };
                SignalingRequest::CreateTransport(request)
            }
            "connect-transport" => {
                SignalingRequest::ConnectTransport(payload(&message_type, data)?)
            }
            "produce" => SignalingRequest::Produce(payload(&message_type, data)?),
            "consume" => SignalingRequest::Consume(payload(&message_type, data)?),
            "resume-consumer" => SignalingRequest::ResumeConsumer(payload(&message_type, data)?),
            "pause-producer" => SignalingRequest::PauseProducer(payload(&message_type, data)?),
            "resume-producer" => SignalingRequest::ResumeProducer(payload(&message_type, data)?),
            "close-producer" => SignalingRequest::CloseProducer(payload(&message_type, data)?),
            "toggle-mute" => SignalingRequest::ToggleMute,
            "toggle-video" => SignalingRequest::ToggleVideo,
            "toggle-hand" => SignalingRequest::ToggleHand,
            "start-screen-share" => SignalingRequest::StartScreenShare,
            "stop-screen-share" => SignalingRequest::StopScreenShare,
            "leave-meeting" => SignalingRequest::LeaveMeeting,
            other => {
                return Err(SfuError::InvalidRequest(format!(
                    "Unknown message type: {other}"
                )))
            }
        };

        Ok(request)
    }
}

fn payload<T: DeserializeOwned>(message_type: &str, data: Value) -> Result<T, SfuError> {
    serde_json::from_value(data)
        .map_err(|e| SfuError::InvalidRequest(format!("Invalid {message_type} payload: {e}")))
}

/// Reply to a successful `join-meeting`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReply {
    pub meeting: MeetingRecord,
    pub participant: ParticipantRecord,
    pub rtp_capabilities: RtpCapabilities,
    /// Other active participants, excluding the joiner.
    pub existing_participants: Vec<ParticipantRecord>,
    /// Producers already published in the room.
    pub producers: Vec<RemoteProducer>,
}

/// Payload of a successful reply. Plain acknowledgements carry none.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReplyData {
    Joined(Box<JoinReply>),
    Transport(TransportDescriptor),
    #[serde(rename_all = "camelCase")]
    Produced {
        producer_id: String,
    },
    Consumer(ConsumerDescriptor),
    /// The caller cannot decode the producer. Not an error.
    #[serde(rename_all = "camelCase")]
    Incompatible {
        producer_id: String,
        incompatible: bool,
    },
    Updated(ParticipantUpdates),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerReply {
    pub id: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ReplyData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl ServerReply {
    #[must_use]
    pub fn ok(id: Value, data: Option<ReplyData>) -> Self {
        Self {
            id,
            success: true,
            data,
            error: None,
        }
    }

    /// Failed reply carrying only the client-safe message.
    #[must_use]
    pub fn error(id: Value, error: &SfuError) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(ReplyError {
                code: error.error_code(),
                message: error.client_message(),
            }),
        }
    }
}
