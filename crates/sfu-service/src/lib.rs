//! SFU Service Library
//!
//! Session orchestration for a multi-room selective forwarding unit:
//!
//! - Media engine worker pool with round-robin room placement
//! - One room per meeting, owning the router and every participant's
//!   transports, producers and consumers
//! - Per-connection signaling state machine (join, negotiate, publish,
//!   subscribe, leave) over an authenticated WebSocket
//! - Ordered teardown on leave, disconnect and room close
//!
//! # Architecture
//!
//! ```text
//! SfuService
//! ├── EngineWorkerPool ── MediaEngineGateway ── dyn MediaEngine
//! ├── RoomRegistryActor (singleton)
//! │   └── RoomActor (one per meeting)
//! │       └── ResourceGraph (one per participant)
//! └── ConnectionActor (one per socket)
//!     └── SignalingSession ── MeetingDirectory
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and connection actors
//! - [`engine`] - Media engine interface, gateway and loopback engine
//! - [`workers`] - Engine worker pool and fatal-death policy
//! - [`signaling`] - Wire protocol, session state machine, WebSocket endpoint
//! - [`directory`] - Meeting/participant records and join authorization
//! - [`auth`] - User token validation
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client error codes
//! - [`observability`] - Metrics and health endpoints

pub mod actors;
pub mod auth;
pub mod config;
pub mod directory;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod service;
pub mod signaling;
pub mod workers;

pub use service::SfuService;
