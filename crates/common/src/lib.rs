//! Common utilities and types shared across SFU components.

#![warn(clippy::pedantic)]

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT utilities (size limits, iat validation, user claims)
pub mod jwt;
