//! Media engine interface.
//!
//! The SFU never processes RTP itself. Everything it knows about workers,
//! routers, transports, producers and consumers goes through the
//! [`MediaEngine`] trait, and only [`gateway::MediaEngineGateway`] calls it.
//!
//! # Components
//!
//! - [`types`] - Typed parameters and descriptors exchanged with the engine
//! - [`gateway`] - Logging/metrics pass-through used by the rest of the crate
//! - [`loopback`] - In-process engine used for local runs and tests

pub mod gateway;
pub mod loopback;
pub mod types;

pub use gateway::MediaEngineGateway;
pub use loopback::LoopbackEngine;
pub use types::*;

use crate::errors::EngineError;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Engine operations, used for metric labels and loopback fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreateWorker,
    CloseWorker,
    CreateRouter,
    CloseRouter,
    CreateTransport,
    ConnectTransport,
    CloseTransport,
    Produce,
    PauseProducer,
    ResumeProducer,
    CloseProducer,
    CanConsume,
    Consume,
    ResumeConsumer,
    CloseConsumer,
}

impl EngineOp {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EngineOp::CreateWorker => "create_worker",
            EngineOp::CloseWorker => "close_worker",
            EngineOp::CreateRouter => "create_router",
            EngineOp::CloseRouter => "close_router",
            EngineOp::CreateTransport => "create_transport",
            EngineOp::ConnectTransport => "connect_transport",
            EngineOp::CloseTransport => "close_transport",
            EngineOp::Produce => "produce",
            EngineOp::PauseProducer => "pause_producer",
            EngineOp::ResumeProducer => "resume_producer",
            EngineOp::CloseProducer => "close_producer",
            EngineOp::CanConsume => "can_consume",
            EngineOp::Consume => "consume",
            EngineOp::ResumeConsumer => "resume_consumer",
            EngineOp::CloseConsumer => "close_consumer",
        }
    }
}

/// The external media engine.
///
/// All calls are asynchronous and may fail with an [`EngineError`]. Closing
/// a resource also closes everything the engine hangs off it (a router's
/// transports, a transport's producers and consumers, a producer's
/// consumers). Closing an already closed resource is a no-op.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Start a worker process.
    async fn create_worker(&self, settings: &WorkerSettings) -> Result<WorkerId, EngineError>;

    /// Subscribe to worker lifecycle events.
    fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent>;

    async fn close_worker(&self, worker_id: WorkerId) -> Result<(), EngineError>;

    /// Create a routing context on `worker_id` offering `codecs`.
    async fn create_router(
        &self,
        worker_id: WorkerId,
        codecs: &[RtpCodecCapability],
    ) -> Result<RouterInfo, EngineError>;

    async fn close_router(&self, router_id: &str) -> Result<(), EngineError>;

    async fn create_transport(
        &self,
        router_id: &str,
        options: &TransportOptions,
    ) -> Result<TransportDescriptor, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError>;

    /// Returns the new producer id.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String, EngineError>;

    async fn pause_producer(&self, producer_id: &str) -> Result<(), EngineError>;

    async fn resume_producer(&self, producer_id: &str) -> Result<(), EngineError>;

    async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError>;

    /// Whether a client with `rtp_capabilities` can decode `producer_id`.
    async fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError>;

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerDescriptor, EngineError>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;
}
