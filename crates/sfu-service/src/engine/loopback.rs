//! In-process media engine.
//!
//! `LoopbackEngine` keeps the engine's object graph in memory without moving
//! any packets. It enforces the same rules a real engine does (capability
//! matching, connect-once transports, cascading closes) so the orchestration
//! layer can run locally and under test.
//!
//! Test hooks:
//! - per-operation call counters and per-resource close counters
//! - one-shot fault injection with [`LoopbackEngine::fail_next`]
//! - artificial latency with [`LoopbackEngine::set_latency`]
//! - simulated crashes with [`LoopbackEngine::kill_worker`]

use super::{
    ConsumerDescriptor, DtlsFingerprint, DtlsParameters, DtlsRole, EngineOp, IceCandidate,
    IceParameters, IceProtocol, MediaEngine, MediaKind, RouterInfo, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpParameters, TransportDescriptor, TransportOptions,
    WorkerEvent, WorkerId, WorkerSettings,
};
use crate::errors::EngineError;

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// First dynamic RTP payload type handed out to router codecs.
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

struct WorkerState {
    settings: WorkerSettings,
    next_port: u16,
    closed: bool,
}

struct RouterState {
    worker_id: WorkerId,
    capabilities: RtpCapabilities,
}

struct TransportState {
    router_id: String,
    connected: bool,
}

struct ProducerState {
    transport_id: String,
    router_id: String,
    kind: MediaKind,
    codec: RtpCodecParameters,
    paused: bool,
}

struct ConsumerState {
    transport_id: String,
    producer_id: String,
    paused: bool,
}

/// Live object counts, for leak assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

#[derive(Default)]
struct LoopbackState {
    next_worker_id: WorkerId,
    workers: HashMap<WorkerId, WorkerState>,
    routers: HashMap<String, RouterState>,
    transports: HashMap<String, TransportState>,
    producers: HashMap<String, ProducerState>,
    consumers: HashMap<String, ConsumerState>,
    calls: HashMap<EngineOp, usize>,
    closes: HashMap<String, usize>,
    faults: HashMap<EngineOp, VecDeque<EngineError>>,
}

impl LoopbackState {
    /// Count the call and pop an injected fault, if any.
    fn enter(&mut self, op: EngineOp) -> Result<(), EngineError> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record_close(&mut self, id: &str) {
        *self.closes.entry(id.to_string()).or_insert(0) += 1;
    }

    fn drop_consumer(&mut self, consumer_id: &str) {
        self.consumers.remove(consumer_id);
    }

    fn drop_producer(&mut self, producer_id: &str) {
        if self.producers.remove(producer_id).is_some() {
            self.consumers.retain(|_, c| c.producer_id != producer_id);
        }
    }

    fn drop_transport(&mut self, transport_id: &str) {
        if self.transports.remove(transport_id).is_none() {
            return;
        }
        let producers: Vec<String> = self
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in producers {
            self.drop_producer(&producer_id);
        }
        self.consumers.retain(|_, c| c.transport_id != transport_id);
    }

    fn drop_router(&mut self, router_id: &str) {
        if self.routers.remove(router_id).is_none() {
            return;
        }
        let transports: Vec<String> = self
            .transports
            .iter()
            .filter(|(_, t)| t.router_id == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in transports {
            self.drop_transport(&transport_id);
        }
    }

    fn drop_worker(&mut self, worker_id: WorkerId) {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.closed = true;
        }
        let routers: Vec<String> = self
            .routers
            .iter()
            .filter(|(_, r)| r.worker_id == worker_id)
            .map(|(id, _)| id.clone())
            .collect();
        for router_id in routers {
            self.drop_router(&router_id);
        }
    }

    /// Router-level compatibility of a producer with a client's capabilities.
    fn compatible(&self, producer: &ProducerState, caps: &RtpCapabilities) -> bool {
        let codec = &producer.codec;
        let router_ok = self
            .routers
            .get(&producer.router_id)
            .is_some_and(|r| r.capabilities.supports(&codec.mime_type, codec.clock_rate));
        router_ok && caps.supports(&codec.mime_type, codec.clock_rate)
    }
}

/// In-process [`MediaEngine`] implementation.
pub struct LoopbackEngine {
    state: Mutex<LoopbackState>,
    events: broadcast::Sender<WorkerEvent>,
    latency_ms: AtomicU64,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(LoopbackState::default()),
            events,
            latency_ms: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Delay every subsequent engine call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: EngineOp, error: EngineError) {
        self.lock().faults.entry(op).or_default().push_back(error);
    }

    /// How many times `op` has been called.
    #[must_use]
    pub fn call_count(&self, op: EngineOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// How many close calls targeted the resource `id`.
    #[must_use]
    pub fn close_count(&self, id: &str) -> usize {
        self.lock().closes.get(id).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn resource_counts(&self) -> ResourceCounts {
        let state = self.lock();
        ResourceCounts {
            routers: state.routers.len(),
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
        }
    }

    #[must_use]
    pub fn producer_exists(&self, producer_id: &str) -> bool {
        self.lock().producers.contains_key(producer_id)
    }

    #[must_use]
    pub fn consumer_exists(&self, consumer_id: &str) -> bool {
        self.lock().consumers.contains_key(consumer_id)
    }

    #[must_use]
    pub fn router_exists(&self, router_id: &str) -> bool {
        self.lock().routers.contains_key(router_id)
    }

    /// Media flows when the consumer and its producer are both unpaused.
    #[must_use]
    pub fn is_flowing(&self, consumer_id: &str) -> bool {
        let state = self.lock();
        state.consumers.get(consumer_id).is_some_and(|c| {
            !c.paused
                && state
                    .producers
                    .get(&c.producer_id)
                    .is_some_and(|p| !p.paused)
        })
    }

    /// Simulate an unexpected worker crash.
    pub fn kill_worker(&self, worker_id: WorkerId) {
        self.lock().drop_worker(worker_id);
        error!(
            target: "sfu.engine",
            worker_id = worker_id,
            "Loopback worker killed"
        );
        let _ = self.events.send(WorkerEvent::Died {
            worker_id,
            reason: "killed".to_string(),
        });
    }

    fn fingerprint() -> String {
        let bytes: Vec<u8> = Uuid::new_v4()
            .as_bytes()
            .iter()
            .chain(Uuid::new_v4().as_bytes().iter())
            .copied()
            .collect();
        bytes
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_worker(&self, settings: &WorkerSettings) -> Result<WorkerId, EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::CreateWorker)?;

        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::Rejected("invalid RTC port range".to_string()));
        }

        let worker_id = state.next_worker_id;
        state.next_worker_id += 1;
        state.workers.insert(
            worker_id,
            WorkerState {
                settings: settings.clone(),
                next_port: settings.rtc_min_port,
                closed: false,
            },
        );

        debug!(target: "sfu.engine", worker_id = worker_id, "Loopback worker started");
        Ok(worker_id)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    async fn close_worker(&self, worker_id: WorkerId) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::CloseWorker)?;
        state.record_close(&format!("worker-{worker_id}"));
        state.drop_worker(worker_id);
        Ok(())
    }

    async fn create_router(
        &self,
        worker_id: WorkerId,
        codecs: &[RtpCodecCapability],
    ) -> Result<RouterInfo, EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::CreateRouter)?;

        match state.workers.get(&worker_id) {
            Some(worker) if !worker.closed => {}
            _ => return Err(EngineError::WorkerClosed(worker_id)),
        }

        let mut payload_type = FIRST_DYNAMIC_PAYLOAD_TYPE;
        let codecs = codecs
            .iter()
            .map(|codec| {
                let mut codec = codec.clone();
                if codec.preferred_payload_type.is_none() {
                    codec.preferred_payload_type = Some(payload_type);
                    payload_type = payload_type.saturating_add(1);
                }
                codec
            })
            .collect();
        let capabilities = RtpCapabilities {
            codecs,
            header_extensions: Vec::new(),
        };

        let id = Uuid::new_v4().to_string();
        state.routers.insert(
            id.clone(),
            RouterState {
                worker_id,
                capabilities: capabilities.clone(),
            },
        );

        Ok(RouterInfo {
            id,
            worker_id,
            rtp_capabilities: capabilities,
        })
    }

    async fn close_router(&self, router_id: &str) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::CloseRouter)?;
        state.record_close(router_id);
        state.drop_router(router_id);
        Ok(())
    }

    async fn create_transport(
        &self,
        router_id: &str,
        options: &TransportOptions,
    ) -> Result<TransportDescriptor, EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::CreateTransport)?;

        let worker_id = state
            .routers
            .get(router_id)
            .map(|r| r.worker_id)
            .ok_or_else(|| EngineError::RouterNotFound(router_id.to_string()))?;

        let port = match state.workers.get_mut(&worker_id) {
            Some(worker) if !worker.closed => {
                let port = worker.next_port;
                worker.next_port = if port >= worker.settings.rtc_max_port {
                    worker.settings.rtc_min_port
                } else {
                    port + 1
                };
                port
            }
            _ => return Err(EngineError::WorkerClosed(worker_id)),
        };

        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.clone());
        let (udp_priority, tcp_priority) = if options.prefer_udp {
            (1_076_302_079, 1_076_276_479)
        } else {
            (1_076_276_479, 1_076_302_079)
        };

        let mut ice_candidates = Vec::new();
        if options.enable_udp {
            ice_candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: udp_priority,
                ip: ip.clone(),
                protocol: IceProtocol::Udp,
                port,
                candidate_type: "host".to_string(),
            });
        }
        if options.enable_tcp {
            ice_candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: tcp_priority,
                ip,
                protocol: IceProtocol::Tcp,
                port,
                candidate_type: "host".to_string(),
            });
        }
        if ice_candidates.is_empty() {
            return Err(EngineError::Rejected(
                "at least one of UDP or TCP must be enabled".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        state.transports.insert(
            id.clone(),
            TransportState {
                router_id: router_id.to_string(),
                connected: false,
            },
        );

        Ok(TransportDescriptor {
            id,
            ice_parameters: IceParameters {
                username_fragment: Uuid::new_v4().simple().to_string(),
                password: Uuid::new_v4().simple().to_string(),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Auto),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: Self::fingerprint(),
                }],
            },
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::ConnectTransport)?;

        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Rejected(
                "dtlsParameters must contain a fingerprint".to_string(),
            ));
        }

        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?;
        if transport.connected {
            return Err(EngineError::AlreadyConnected(transport_id.to_string()));
        }
        transport.connected = true;
        Ok(())
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::CloseTransport)?;
        state.record_close(transport_id);
        state.drop_transport(transport_id);
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String, EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::Produce)?;

        let router_id = state
            .transports
            .get(transport_id)
            .map(|t| t.router_id.clone())
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?;

        let codec = rtp_parameters.codecs.first().cloned().ok_or_else(|| {
            EngineError::Rejected("rtpParameters must contain at least one codec".to_string())
        })?;

        let supported = state
            .routers
            .get(&router_id)
            .is_some_and(|r| r.capabilities.supports(&codec.mime_type, codec.clock_rate));
        if !supported {
            return Err(EngineError::Rejected(format!(
                "codec {} not supported by router",
                codec.mime_type
            )));
        }

        let id = Uuid::new_v4().to_string();
        state.producers.insert(
            id.clone(),
            ProducerState {
                transport_id: transport_id.to_string(),
                router_id,
                kind,
                codec,
                paused: false,
            },
        );
        Ok(id)
    }

    async fn pause_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::PauseProducer)?;
        let producer = state
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.to_string()))?;
        producer.paused = true;
        Ok(())
    }

    async fn resume_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::ResumeProducer)?;
        let producer = state
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.to_string()))?;
        producer.paused = false;
        Ok(())
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::CloseProducer)?;
        state.record_close(producer_id);
        state.drop_producer(producer_id);
        Ok(())
    }

    async fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::CanConsume)?;

        if !state.routers.contains_key(router_id) {
            return Err(EngineError::RouterNotFound(router_id.to_string()));
        }
        // An unknown producer is simply not consumable.
        Ok(state
            .producers
            .get(producer_id)
            .is_some_and(|p| p.router_id == router_id && state.compatible(p, rtp_capabilities)))
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerDescriptor, EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::Consume)?;

        let router_id = state
            .transports
            .get(transport_id)
            .map(|t| t.router_id.clone())
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?;
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.to_string()))?;

        if producer.router_id != router_id || !state.compatible(producer, rtp_capabilities) {
            return Err(EngineError::Rejected("cannot consume".to_string()));
        }

        let mut codec = producer.codec.clone();
        if let Some(payload_type) = rtp_capabilities
            .codecs
            .iter()
            .find(|c| c.matches(&codec.mime_type, codec.clock_rate))
            .and_then(|c| c.preferred_payload_type)
        {
            codec.payload_type = payload_type;
        }
        let kind = producer.kind;

        let id = Uuid::new_v4().to_string();
        state.consumers.insert(
            id.clone(),
            ConsumerState {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                paused,
            },
        );

        Ok(ConsumerDescriptor {
            id,
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters: RtpParameters {
                mid: None,
                codecs: vec![codec],
                header_extensions: Vec::new(),
                encodings: Vec::new(),
                rtcp: None,
            },
            paused,
        })
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::ResumeConsumer)?;
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::ConsumerNotFound(consumer_id.to_string()))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.lock();
        state.enter(EngineOp::CloseConsumer)?;
        state.record_close(consumer_id);
        state.drop_consumer(consumer_id);
        Ok(())
    }
}
