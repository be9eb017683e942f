//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] wrappers used across the SFU for signing keys,
//! meeting passwords and bearer tokens. `SecretString` and `SecretBox<T>`
//! implement `Debug` with redaction, so a struct deriving `Debug` that holds
//! one of them is safe to log.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct JoinRequest {
//!     meeting_id: String,
//!     password: SecretString,
//! }
//!
//! let req = JoinRequest {
//!     meeting_id: "standup".to_string(),
//!     password: SecretString::from("hunter2"),
//! };
//!
//! assert!(!format!("{req:?}").contains("hunter2"));
//! assert_eq!(req.password.expose_secret(), "hunter2");
//! ```
//!
//! Use `SecretString` for:
//! - Meeting passwords carried in signaling messages
//! - The user-token signing key
//! - Bearer tokens pulled off an upgrade request

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
