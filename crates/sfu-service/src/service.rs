//! `SfuService` - wires the engine, worker pool, room registry and signaling
//! together.
//!
//! The binary builds one service at startup. Tests build one around a
//! `LoopbackEngine` and an `InMemoryDirectory`.

use crate::actors::{ActorMetrics, RoomRegistryHandle, RoomSettings};
use crate::auth::TokenValidator;
use crate::config::Config;
use crate::directory::MeetingDirectory;
use crate::engine::{MediaEngine, MediaEngineGateway};
use crate::errors::SfuError;
use crate::signaling::{SessionContext, SignalingState};
use crate::workers::EngineWorkerPool;

use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct SfuService {
    gateway: MediaEngineGateway,
    pool: Arc<EngineWorkerPool>,
    registry: RoomRegistryHandle,
    directory: Arc<dyn MeetingDirectory>,
    validator: TokenValidator,
    metrics: Arc<ActorMetrics>,
}

impl SfuService {
    /// Start the worker pool and the room registry.
    ///
    /// # Errors
    ///
    /// Fails if any engine worker cannot be started.
    #[instrument(skip_all, fields(sfu_id = %config.sfu_id))]
    pub async fn start(
        config: &Config,
        engine: Arc<dyn MediaEngine>,
        directory: Arc<dyn MeetingDirectory>,
    ) -> Result<Self, SfuError> {
        let gateway = MediaEngineGateway::new(engine);
        let pool = EngineWorkerPool::initialize(
            gateway.clone(),
            config.worker_count,
            &config.worker_settings(),
        )
        .await?;

        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(
            config.sfu_id.clone(),
            Arc::clone(&pool),
            gateway.clone(),
            RoomSettings {
                media_codecs: config.media_codecs.clone(),
                transport_options: config.transport_options(),
            },
            Arc::clone(&metrics),
        );

        info!(
            target: "sfu.service",
            workers = pool.len(),
            "SFU service started"
        );

        Ok(Self {
            gateway,
            pool,
            registry,
            directory,
            validator: TokenValidator::new(&config.jwt_secret),
            metrics,
        })
    }

    #[must_use]
    pub fn gateway(&self) -> &MediaEngineGateway {
        &self.gateway
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<EngineWorkerPool> {
        &self.pool
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<dyn MeetingDirectory> {
        &self.directory
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            registry: self.registry.clone(),
            directory: Arc::clone(&self.directory),
        }
    }

    /// State for the `/ws` router. Connections are cancelled with the
    /// registry.
    #[must_use]
    pub fn signaling_state(&self) -> Arc<SignalingState> {
        Arc::new(SignalingState::new(
            self.validator.clone(),
            self.session_context(),
            Arc::clone(&self.metrics),
            self.registry.child_token(),
        ))
    }

    /// End a meeting: new joins are refused and the room, if any, is closed.
    /// Members receive `room-closed`.
    ///
    /// # Errors
    ///
    /// Directory failures (e.g. `MeetingNotFound`) and registry failures
    /// other than the room already being gone.
    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    pub async fn end_meeting(&self, meeting_id: &str) -> Result<(), SfuError> {
        self.directory.end_meeting(meeting_id).await?;

        match self.registry.remove(meeting_id.to_string()).await {
            Ok(()) | Err(SfuError::RoomNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!(target: "sfu.service", meeting_id = %meeting_id, "Meeting ended");
        Ok(())
    }

    /// Close every room, then every worker.
    pub async fn shutdown(&self) {
        if let Err(e) = self.registry.shutdown().await {
            warn!(target: "sfu.service", error = %e, "Room registry shutdown error");
        }
        self.registry.cancel();
        self.pool.shutdown().await;
        info!(target: "sfu.service", "SFU service stopped");
    }
}
