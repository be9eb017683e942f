//! Actor model implementation for the SFU.
//!
//! ```text
//! RoomRegistryActor (singleton per SFU instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per active meeting)
//!         ├── owns the router and one ResourceGraph per participant
//!         └── fans events out to member connections
//!
//! ConnectionActor (one per signaling socket)
//! └── owns a SignalingSession bound to at most one room
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per room**: every structural change goes through the
//!   room's mailbox; rooms run in parallel with each other
//! - **Single-flight room creation**: concurrent first joins share one router
//! - **CancellationToken propagation**: the registry hands child tokens to
//!   rooms and connections
//! - **Mailbox monitoring**: depth thresholds with metrics (Room: 100/500,
//!   Connection: 50/200)
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` singleton that supervises rooms
//! - [`room`] - `RoomActor` per active meeting
//! - [`graph`] - per-participant media resources
//! - [`connection`] - `ConnectionActor` per signaling socket
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod graph;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle, EVENT_QUEUE_CAPACITY};
pub use graph::ResourceGraph;
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::{RoomRegistryActor, RoomRegistryHandle, RoomSettings};
pub use room::{RoomActor, RoomHandle};
