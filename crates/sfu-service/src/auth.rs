//! User token validation for signaling connections.
//!
//! # Security
//!
//! - Tokens are size- and shape-checked before any decoding
//! - Only HS256 is accepted
//! - `exp` is enforced; `iat` may not lie further than the clock skew in the
//!   future
//! - Every failure yields the same client message

use crate::directory::UserIdentity;
use crate::errors::SfuError;

use common::jwt::{check_token_shape, validate_iat, UserClaims, DEFAULT_CLOCK_SKEW};
use common::secret::{ExposeSecret, SecretString};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::time::Duration;
use tracing::instrument;

const INVALID_TOKEN: &str = "The access token is invalid or expired";

/// Validates user tokens signed with the shared HS256 secret.
#[derive(Clone)]
pub struct TokenValidator {
    key: DecodingKey,
    clock_skew: Duration,
}

impl TokenValidator {
    #[must_use]
    pub fn new(secret: &SecretString) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            clock_skew: DEFAULT_CLOCK_SKEW,
        }
    }

    /// Validate a token and return the user it identifies.
    ///
    /// # Errors
    ///
    /// `SfuError::Unauthorized` with a generic message for every failure.
    #[instrument(skip_all)]
    pub fn validate(&self, token: &str) -> Result<UserIdentity, SfuError> {
        check_token_shape(token).map_err(|e| {
            tracing::debug!(target: "sfu.auth", error = ?e, "Token shape check failed");
            SfuError::Unauthorized(INVALID_TOKEN.to_string())
        })?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let claims = decode::<UserClaims>(token, &self.key, &validation)
            .map_err(|e| {
                tracing::debug!(target: "sfu.auth", error = %e, "Token verification failed");
                SfuError::Unauthorized(INVALID_TOKEN.to_string())
            })?
            .claims;

        if let Err(e) = validate_iat(claims.iat, self.clock_skew) {
            tracing::debug!(target: "sfu.auth", error = ?e, "Token iat validation failed");
            return Err(SfuError::Unauthorized(INVALID_TOKEN.to_string()));
        }

        if claims.sub.is_empty() {
            tracing::debug!(target: "sfu.auth", "Token has empty subject");
            return Err(SfuError::Unauthorized(INVALID_TOKEN.to_string()));
        }

        let display_name = if claims.name.is_empty() {
            claims.sub.clone()
        } else {
            claims.name
        };

        tracing::debug!(target: "sfu.auth", "Token validated successfully");
        Ok(UserIdentity {
            user_id: claims.sub,
            display_name,
        })
    }
}
