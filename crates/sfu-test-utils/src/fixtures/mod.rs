//! Pre-configured test data fixtures for SFU testing.
//!
//! Provides:
//! - Users with stable ids
//! - Client RTP capabilities (audio only, video only, everything)
//! - Producer RTP parameters and DTLS parameters
//! - Signed user tokens

use common::jwt::UserClaims;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use sfu_service::directory::UserIdentity;
use sfu_service::engine::{
    DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters,
};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// HS256 secret shared by `TestSfu` and `TestToken`.
pub const TEST_JWT_SECRET: &str = "sfu-test-utils-secret-at-least-32-bytes";

/// Test user fixture.
#[derive(Debug, Clone)]
pub struct TestUser {
    /// User ID.
    pub user_id: String,
    /// Display name.
    pub display_name: String,
}

impl TestUser {
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            display_name: format!("User {user_id}"),
            user_id,
        }
    }

    /// Create a test user with a random ID.
    #[must_use]
    pub fn random() -> Self {
        Self::new(format!("user-{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    #[must_use]
    pub fn identity(&self) -> UserIdentity {
        UserIdentity {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// Signed user token builder.
#[derive(Debug, Clone)]
pub struct TestToken {
    user: TestUser,
    ttl: Duration,
    secret: String,
}

impl TestToken {
    #[must_use]
    pub fn for_user(user: &TestUser) -> Self {
        Self {
            user: user.clone(),
            ttl: Duration::from_secs(3600),
            secret: TEST_JWT_SECRET.to_string(),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sign with a different secret (for rejection tests).
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// # Panics
    ///
    /// Panics if signing fails.
    #[must_use]
    pub fn build(&self) -> String {
        let claims = UserClaims::issued_now(
            self.user.user_id.clone(),
            self.user.display_name.clone(),
            self.ttl,
        );
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .expect("token signing failed")
    }
}

fn capability(kind: MediaKind, mime_type: &str, clock_rate: u32, channels: Option<u8>) -> RtpCodecCapability {
    RtpCodecCapability {
        kind,
        mime_type: mime_type.to_string(),
        preferred_payload_type: None,
        clock_rate,
        channels,
        parameters: BTreeMap::new(),
        rtcp_feedback: Vec::new(),
    }
}

/// Client that can only decode Opus audio.
#[must_use]
pub fn audio_only_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![capability(MediaKind::Audio, "audio/opus", 48000, Some(2))],
        header_extensions: Vec::new(),
    }
}

/// Client that can only decode VP8 video.
#[must_use]
pub fn video_only_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![capability(MediaKind::Video, "video/VP8", 90000, None)],
        header_extensions: Vec::new(),
    }
}

/// Client that decodes Opus and VP8.
#[must_use]
pub fn full_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            capability(MediaKind::Audio, "audio/opus", 48000, Some(2)),
            capability(MediaKind::Video, "video/VP8", 90000, None),
        ],
        header_extensions: Vec::new(),
    }
}

fn rtp_parameters(mime_type: &str, payload_type: u8, clock_rate: u32, channels: Option<u8>) -> RtpParameters {
    RtpParameters {
        mid: None,
        codecs: vec![RtpCodecParameters {
            mime_type: mime_type.to_string(),
            payload_type,
            clock_rate,
            channels,
            parameters: BTreeMap::new(),
            rtcp_feedback: Vec::new(),
        }],
        header_extensions: Vec::new(),
        encodings: vec![json!({"ssrc": 1111})],
        rtcp: None,
    }
}

#[must_use]
pub fn opus_rtp_parameters() -> RtpParameters {
    rtp_parameters("audio/opus", 111, 48000, Some(2))
}

#[must_use]
pub fn vp8_rtp_parameters() -> RtpParameters {
    rtp_parameters("video/VP8", 96, 90000, None)
}

#[must_use]
pub fn test_dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: Some(DtlsRole::Client),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89".to_string(),
        }],
    }
}

/// Serialize a fixture for use in a signaling payload.
///
/// # Panics
///
/// Panics if serialization fails.
#[must_use]
pub fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("fixture serialization failed")
}
