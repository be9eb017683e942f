//! Observability module for the SFU.
//!
//! # Privacy by Default
//!
//! Instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Meeting and participant ids are logged; tokens, passwords and SDP-level
//! parameters are not.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_rooms_active` | Gauge | none | Rooms currently registered |
//! | `sfu_participants_active` | Gauge | none | Participants across rooms |
//! | `sfu_connections_active` | Gauge | none | Open signaling sockets |
//! | `sfu_signaling_latency_seconds` | Histogram | `message_type`, `status` | Request handling time |
//! | `sfu_engine_call_latency_seconds` | Histogram | `operation`, `status` | Media engine call time |
//! | `sfu_events_dropped_total` | Counter | none | Room events lost to backpressure |
//! | `sfu_worker_deaths_total` | Counter | none | Unexpected engine worker exits |
//! | `sfu_actor_panics_total` | Counter | `actor_type` | Actor task panics |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
