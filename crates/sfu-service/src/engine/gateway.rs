//! `MediaEngineGateway` - the only component that talks to the media engine.
//!
//! Every method is a pass-through: it forwards to the [`MediaEngine`],
//! records latency, and logs failures with the resource id involved. It
//! never retries and never changes an engine error.

use super::{
    ConsumerDescriptor, DtlsParameters, EngineOp, MediaEngine, MediaKind, RouterInfo,
    RtpCapabilities, RtpCodecCapability, RtpParameters, TransportDescriptor, TransportOptions,
    WorkerEvent, WorkerId, WorkerSettings,
};
use crate::errors::EngineError;
use crate::observability::metrics;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Typed façade over a [`MediaEngine`].
#[derive(Clone)]
pub struct MediaEngineGateway {
    engine: Arc<dyn MediaEngine>,
}

impl MediaEngineGateway {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self { engine }
    }

    async fn observe<T, F>(&self, op: EngineOp, target_id: &str, call: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        let start = Instant::now();
        let result = call.await;
        let elapsed = start.elapsed();

        match &result {
            Ok(_) => {
                metrics::record_engine_call(op.as_str(), "success", elapsed);
                debug!(
                    target: "sfu.engine",
                    operation = op.as_str(),
                    target_id = %target_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Engine call completed"
                );
            }
            Err(e) => {
                metrics::record_engine_call(op.as_str(), "error", elapsed);
                warn!(
                    target: "sfu.engine",
                    operation = op.as_str(),
                    target_id = %target_id,
                    error = %e,
                    "Engine call failed"
                );
            }
        }

        result
    }

    pub async fn create_worker(&self, settings: &WorkerSettings) -> Result<WorkerId, EngineError> {
        self.observe(
            EngineOp::CreateWorker,
            "-",
            self.engine.create_worker(settings),
        )
        .await
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.engine.subscribe_events()
    }

    pub async fn close_worker(&self, worker_id: WorkerId) -> Result<(), EngineError> {
        self.observe(
            EngineOp::CloseWorker,
            &worker_id.to_string(),
            self.engine.close_worker(worker_id),
        )
        .await
    }

    /// Create the routing context for a new room.
    pub async fn create_router(
        &self,
        worker_id: WorkerId,
        codecs: &[RtpCodecCapability],
    ) -> Result<RouterInfo, EngineError> {
        self.observe(
            EngineOp::CreateRouter,
            &worker_id.to_string(),
            self.engine.create_router(worker_id, codecs),
        )
        .await
    }

    pub async fn close_router(&self, router_id: &str) -> Result<(), EngineError> {
        self.observe(
            EngineOp::CloseRouter,
            router_id,
            self.engine.close_router(router_id),
        )
        .await
    }

    pub async fn create_transport(
        &self,
        router_id: &str,
        options: &TransportOptions,
    ) -> Result<TransportDescriptor, EngineError> {
        self.observe(
            EngineOp::CreateTransport,
            router_id,
            self.engine.create_transport(router_id, options),
        )
        .await
    }

    pub async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        self.observe(
            EngineOp::ConnectTransport,
            transport_id,
            self.engine.connect_transport(transport_id, dtls_parameters),
        )
        .await
    }

    pub async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError> {
        self.observe(
            EngineOp::CloseTransport,
            transport_id,
            self.engine.close_transport(transport_id),
        )
        .await
    }

    pub async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String, EngineError> {
        self.observe(
            EngineOp::Produce,
            transport_id,
            self.engine.produce(transport_id, kind, rtp_parameters),
        )
        .await
    }

    pub async fn pause_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.observe(
            EngineOp::PauseProducer,
            producer_id,
            self.engine.pause_producer(producer_id),
        )
        .await
    }

    pub async fn resume_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.observe(
            EngineOp::ResumeProducer,
            producer_id,
            self.engine.resume_producer(producer_id),
        )
        .await
    }

    pub async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.observe(
            EngineOp::CloseProducer,
            producer_id,
            self.engine.close_producer(producer_id),
        )
        .await
    }

    pub async fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        self.observe(
            EngineOp::CanConsume,
            producer_id,
            self.engine
                .can_consume(router_id, producer_id, rtp_capabilities),
        )
        .await
    }

    pub async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerDescriptor, EngineError> {
        self.observe(
            EngineOp::Consume,
            transport_id,
            self.engine
                .consume(transport_id, producer_id, rtp_capabilities, paused),
        )
        .await
    }

    pub async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.observe(
            EngineOp::ResumeConsumer,
            consumer_id,
            self.engine.resume_consumer(consumer_id),
        )
        .await
    }

    pub async fn close_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.observe(
            EngineOp::CloseConsumer,
            consumer_id,
            self.engine.close_consumer(consumer_id),
        )
        .await
    }
}
