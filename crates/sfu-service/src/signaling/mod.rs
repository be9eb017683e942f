//! Client signaling.
//!
//! - [`protocol`] - JSON request/reply/event wire format
//! - [`session`] - per-connection `Unjoined → Joined → Left` state machine
//! - [`ws`] - authenticated WebSocket endpoint

pub mod protocol;
pub mod session;
pub mod ws;

pub use protocol::{ClientFrame, ReplyData, ServerReply, SignalingRequest};
pub use session::{SessionContext, SignalingSession};
pub use ws::{signaling_router, SignalingState};
