//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU service.
//!
//! This crate wires the service around the in-process `LoopbackEngine` and
//! an `InMemoryDirectory`, so signaling flows run end to end without a native
//! media engine or a database.
//!
//! ## Modules
//!
//! - `fixtures` - Pre-configured test data (users, capabilities, RTP and DTLS
//!   parameters, signed tokens)
//! - `harness` - `TestSfu` and `TestClient` for scripted signaling sessions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let sfu = TestSfu::start().await;
//!     let mut alice = sfu.connect("alice");
//!
//!     let reply = alice.request("join-meeting", json!({"meetingId": "m-1"})).await;
//!     assert_success(&reply);
//! }
//! ```

pub mod fixtures;
pub mod harness;

// Re-export commonly used items
pub use fixtures::*;
pub use harness::*;
