//! SFU error types.
//!
//! Error types map to a stable signaling `ErrorCode` for client replies.
//! Internal details are logged server-side but not exposed to clients.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Kind of per-participant media resource, used by `NotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Transport,
    Producer,
    Consumer,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Transport => "Transport",
            ResourceKind::Producer => "Producer",
            ResourceKind::Consumer => "Consumer",
        };
        f.write_str(name)
    }
}

/// Failures reported by the media engine.
///
/// Engine errors are propagated unchanged by the gateway; callers decide
/// whether to roll back local bookkeeping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The worker hosting the resource is gone.
    #[error("worker {0} is closed")]
    WorkerClosed(u32),

    #[error("router not found: {0}")]
    RouterNotFound(String),

    #[error("transport not found: {0}")]
    TransportNotFound(String),

    #[error("producer not found: {0}")]
    ProducerNotFound(String),

    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    /// `connect` was already called on this transport.
    #[error("transport already connected: {0}")]
    AlreadyConnected(String),

    /// The engine refused the request (bad parameters, unsupported codec).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The engine could not be reached.
    #[error("engine unavailable")]
    Unavailable,
}

/// SFU error type.
///
/// `Incompatible` consume results are not errors; see
/// [`crate::actors::messages::ConsumeOutcome`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SfuError {
    /// Operation on a participant that is not in the room.
    #[error("Participant is not a member of the room")]
    NotAMember,

    /// Duplicate `add_participant` for the same id.
    #[error("Participant is already a member of the room")]
    AlreadyMember,

    /// Unknown transport, producer or consumer id.
    #[error("{0} not found")]
    NotFound(ResourceKind),

    /// The media engine rejected or failed a call.
    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),

    /// Protocol message received out of sequence.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed or unknown signaling message.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An engine worker died unexpectedly.
    #[error("Engine worker {worker_id} died")]
    WorkerFatal { worker_id: u32 },

    /// No room is registered for the meeting.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Meeting not found: {0}")]
    MeetingNotFound(String),

    #[error("Meeting has ended")]
    MeetingEnded,

    #[error("Meeting is full")]
    MeetingFull,

    #[error("Invalid meeting password")]
    InvalidPassword,

    /// User token validation failed.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The service is shutting down.
    #[error("SFU is draining")]
    Draining,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire error codes sent in failed replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotAMember,
    AlreadyMember,
    NotFound,
    EngineError,
    InvalidState,
    InvalidRequest,
    Unauthorized,
    Forbidden,
    MeetingNotFound,
    MeetingEnded,
    MeetingFull,
    Unavailable,
    InternalError,
}

impl SfuError {
    /// Returns the signaling `ErrorCode` value for this error.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SfuError::NotAMember => ErrorCode::NotAMember,
            SfuError::AlreadyMember => ErrorCode::AlreadyMember,
            SfuError::NotFound(_) => ErrorCode::NotFound,
            SfuError::Engine(_) => ErrorCode::EngineError,
            SfuError::InvalidState(_) => ErrorCode::InvalidState,
            SfuError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            SfuError::Unauthorized(_) => ErrorCode::Unauthorized,
            SfuError::InvalidPassword => ErrorCode::Forbidden,
            SfuError::MeetingNotFound(_) | SfuError::RoomNotFound(_) => ErrorCode::MeetingNotFound,
            SfuError::MeetingEnded => ErrorCode::MeetingEnded,
            SfuError::MeetingFull => ErrorCode::MeetingFull,
            SfuError::WorkerFatal { .. } | SfuError::Draining => ErrorCode::Unavailable,
            SfuError::Config(_) | SfuError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SfuError::NotAMember => "You are not a member of this meeting".to_string(),
            SfuError::AlreadyMember => "Already joined".to_string(),
            SfuError::NotFound(kind) => format!("{kind} not found"),
            SfuError::Engine(_) => "Media server rejected the request".to_string(),
            SfuError::InvalidState(msg) | SfuError::InvalidRequest(msg) => msg.clone(),
            SfuError::Unauthorized(_) => "Invalid or expired token".to_string(),
            SfuError::InvalidPassword => "Invalid meeting password".to_string(),
            SfuError::MeetingNotFound(_) | SfuError::RoomNotFound(_) => {
                "Meeting not found".to_string()
            }
            SfuError::MeetingEnded => "Meeting has ended".to_string(),
            SfuError::MeetingFull => "Meeting is at capacity".to_string(),
            SfuError::WorkerFatal { .. } | SfuError::Draining => {
                "Server is shutting down, please reconnect".to_string()
            }
            SfuError::Config(_) | SfuError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}
