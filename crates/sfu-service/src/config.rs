//! SFU configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::engine::{MediaKind, RtpCodecCapability, TransportOptions, WorkerSettings};

use common::secret::SecretString;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default grace delay between a worker death and process exit.
pub const DEFAULT_WORKER_FATAL_GRACE_MS: u64 = 2000;

/// Default RTC port range handed to engine workers.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Default transport listen IP.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default initial outgoing bitrate for new transports (bps).
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;

/// Default participant cap for auto-provisioned meetings.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 100;

/// Default SFU instance ID prefix.
pub const DEFAULT_SFU_ID_PREFIX: &str = "sfu";

/// SFU configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// HS256 key for user tokens presented on the signaling socket.
    pub jwt_secret: SecretString,

    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this SFU instance.
    pub sfu_id: String,

    /// Number of engine workers (default: available CPU parallelism).
    pub worker_count: usize,

    /// Delay between a worker death and process exit.
    pub worker_fatal_grace: Duration,

    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// IP the transports bind to.
    pub listen_ip: String,

    /// Public IP advertised in ICE candidates, when behind NAT.
    pub announced_ip: Option<String>,

    pub initial_outgoing_bitrate: u32,

    /// Create unknown meetings on first join instead of rejecting them.
    pub auto_provision_meetings: bool,

    pub default_max_participants: usize,

    /// Emit logs as JSON lines.
    pub log_json: bool,

    /// Codecs every room's router offers.
    pub media_codecs: Vec<RtpCodecCapability>,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("jwt_secret", &"[REDACTED]")
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("sfu_id", &self.sfu_id)
            .field("worker_count", &self.worker_count)
            .field("worker_fatal_grace", &self.worker_fatal_grace)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_max_port", &self.rtc_max_port)
            .field("listen_ip", &self.listen_ip)
            .field("announced_ip", &self.announced_ip)
            .field("initial_outgoing_bitrate", &self.initial_outgoing_bitrate)
            .field("auto_provision_meetings", &self.auto_provision_meetings)
            .field("default_max_participants", &self.default_max_participants)
            .field("log_json", &self.log_json)
            .field("media_codecs", &self.media_codecs.len())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional variable, rejecting values that are present but malformed.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_secret = vars
            .get("SFU_JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("SFU_JWT_SECRET".to_string()))?;
        let jwt_secret = SecretString::from(jwt_secret.clone());

        let signaling_bind_address = vars
            .get("SFU_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let default_workers = std::thread::available_parallelism().map_or(1, usize::from);
        let worker_count = parse_var(vars, "SFU_WORKER_COUNT", default_workers)?;
        if worker_count == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_WORKER_COUNT must be at least 1".to_string(),
            ));
        }

        let worker_fatal_grace = Duration::from_millis(parse_var(
            vars,
            "SFU_WORKER_FATAL_GRACE_MS",
            DEFAULT_WORKER_FATAL_GRACE_MS,
        )?);

        let rtc_min_port = parse_var(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) exceeds SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let listen_ip = vars
            .get("SFU_LISTEN_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LISTEN_IP.to_string());

        let announced_ip = vars
            .get("SFU_ANNOUNCED_IP")
            .filter(|s| !s.is_empty())
            .cloned();

        let initial_outgoing_bitrate = parse_var(
            vars,
            "SFU_INITIAL_OUTGOING_BITRATE",
            DEFAULT_INITIAL_OUTGOING_BITRATE,
        )?;

        let auto_provision_meetings = parse_var(vars, "SFU_AUTO_PROVISION_MEETINGS", true)?;

        let default_max_participants = parse_var(
            vars,
            "SFU_DEFAULT_MAX_PARTICIPANTS",
            DEFAULT_MAX_PARTICIPANTS,
        )?;

        let log_json = parse_var(vars, "SFU_LOG_JSON", false)?;

        // Generate SFU instance ID
        let sfu_id = vars.get("SFU_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SFU_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            jwt_secret,
            signaling_bind_address,
            health_bind_address,
            sfu_id,
            worker_count,
            worker_fatal_grace,
            rtc_min_port,
            rtc_max_port,
            listen_ip,
            announced_ip,
            initial_outgoing_bitrate,
            auto_provision_meetings,
            default_max_participants,
            log_json,
            media_codecs: default_media_codecs(),
        })
    }

    /// Settings for every engine worker.
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
            log_level: "warn".to_string(),
        }
    }

    /// Options for every WebRTC transport.
    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            listen_ip: self.listen_ip.clone(),
            announced_ip: self.announced_ip.clone(),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: self.initial_outgoing_bitrate,
        }
    }
}

fn codec(
    kind: MediaKind,
    mime_type: &str,
    clock_rate: u32,
    channels: Option<u8>,
    parameters: &[(&str, serde_json::Value)],
) -> RtpCodecCapability {
    RtpCodecCapability {
        kind,
        mime_type: mime_type.to_string(),
        preferred_payload_type: None,
        clock_rate,
        channels,
        parameters: parameters
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect::<BTreeMap<_, _>>(),
        rtcp_feedback: Vec::new(),
    }
}

/// Codec set offered by every room's router.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        codec(MediaKind::Audio, "audio/opus", 48000, Some(2), &[]),
        codec(
            MediaKind::Video,
            "video/VP8",
            90000,
            None,
            &[("x-google-start-bitrate", json!(1000))],
        ),
        codec(
            MediaKind::Video,
            "video/VP9",
            90000,
            None,
            &[
                ("profile-id", json!(2)),
                ("x-google-start-bitrate", json!(1000)),
            ],
        ),
        codec(
            MediaKind::Video,
            "video/h264",
            90000,
            None,
            &[
                ("packetization-mode", json!(1)),
                ("profile-level-id", json!("4d0032")),
                ("level-asymmetry-allowed", json!(1)),
                ("x-google-start-bitrate", json!(1000)),
            ],
        ),
        codec(
            MediaKind::Video,
            "video/h264",
            90000,
            None,
            &[
                ("packetization-mode", json!(1)),
                ("profile-level-id", json!("42e01f")),
                ("level-asymmetry-allowed", json!(1)),
                ("x-google-start-bitrate", json!(1000)),
            ],
        ),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "SFU_JWT_SECRET".to_string(),
            "dGVzdC1zZWNyZXQtMTIzNDU2Nzg5MA==".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(
            config.jwt_secret.expose_secret(),
            "dGVzdC1zZWNyZXQtMTIzNDU2Nzg5MA=="
        );
        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert!(config.worker_count >= 1);
        assert_eq!(
            config.worker_fatal_grace,
            Duration::from_millis(DEFAULT_WORKER_FATAL_GRACE_MS)
        );
        assert_eq!(config.rtc_min_port, DEFAULT_RTC_MIN_PORT);
        assert_eq!(config.rtc_max_port, DEFAULT_RTC_MAX_PORT);
        assert_eq!(config.listen_ip, DEFAULT_LISTEN_IP);
        assert_eq!(config.announced_ip, None);
        assert!(config.auto_provision_meetings);
        assert_eq!(config.default_max_participants, DEFAULT_MAX_PARTICIPANTS);
        assert!(!config.log_json);
        assert!(config.sfu_id.starts_with("sfu-"));
        assert!(!config.media_codecs.is_empty());
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert(
            "SFU_SIGNALING_BIND_ADDRESS".to_string(),
            "127.0.0.1:3001".to_string(),
        );
        vars.insert("SFU_WORKER_COUNT".to_string(), "3".to_string());
        vars.insert("SFU_WORKER_FATAL_GRACE_MS".to_string(), "50".to_string());
        vars.insert("SFU_RTC_MIN_PORT".to_string(), "10000".to_string());
        vars.insert("SFU_RTC_MAX_PORT".to_string(), "10100".to_string());
        vars.insert("SFU_ANNOUNCED_IP".to_string(), "203.0.113.7".to_string());
        vars.insert("SFU_AUTO_PROVISION_MEETINGS".to_string(), "false".to_string());
        vars.insert("SFU_DEFAULT_MAX_PARTICIPANTS".to_string(), "8".to_string());
        vars.insert("SFU_LOG_JSON".to_string(), "true".to_string());
        vars.insert("SFU_ID".to_string(), "sfu-custom-001".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, "127.0.0.1:3001");
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.worker_fatal_grace, Duration::from_millis(50));
        assert_eq!(config.rtc_min_port, 10000);
        assert_eq!(config.rtc_max_port, 10100);
        assert_eq!(config.announced_ip.as_deref(), Some("203.0.113.7"));
        assert!(!config.auto_provision_meetings);
        assert_eq!(config.default_max_participants, 8);
        assert!(config.log_json);
        assert_eq!(config.sfu_id, "sfu-custom-001");

        let options = config.transport_options();
        assert_eq!(options.announced_ip.as_deref(), Some("203.0.113.7"));
        let settings = config.worker_settings();
        assert_eq!(settings.rtc_min_port, 10000);
    }

    #[test]
    fn test_from_vars_missing_jwt_secret() {
        let mut vars = base_vars();
        vars.remove("SFU_JWT_SECRET");

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "SFU_JWT_SECRET"));
    }

    #[test]
    fn test_from_vars_rejects_malformed_numbers() {
        let mut vars = base_vars();
        vars.insert("SFU_WORKER_COUNT".to_string(), "many".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_from_vars_rejects_zero_workers() {
        let mut vars = base_vars();
        vars.insert("SFU_WORKER_COUNT".to_string(), "0".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_from_vars_rejects_inverted_port_range() {
        let mut vars = base_vars();
        vars.insert("SFU_RTC_MIN_PORT".to_string(), "5000".to_string());
        vars.insert("SFU_RTC_MAX_PORT".to_string(), "4000".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("dGVzdC1zZWNyZXQ"));
    }

    #[test]
    fn test_default_codecs_cover_audio_and_video() {
        let codecs = default_media_codecs();
        assert!(codecs.iter().any(|c| c.matches("audio/opus", 48000)));
        assert!(codecs.iter().any(|c| c.matches("video/VP8", 90000)));
        assert!(codecs.iter().any(|c| c.matches("video/H264", 90000)));
    }
}
