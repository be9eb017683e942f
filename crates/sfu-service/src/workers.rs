//! `EngineWorkerPool` - fixed set of media engine workers.
//!
//! Workers are started once at startup and never replaced. Each new room
//! takes the next worker in round-robin order. The worker list is immutable
//! after `initialize`, so `next_worker` only touches an atomic counter.
//!
//! # Worker death
//!
//! An unexpected worker exit is fatal for the whole process: rooms hosted on
//! it are lost and there is no migration. The pool turns engine death events
//! into [`WorkerFatal`] notifications delivered to every handler registered
//! with [`EngineWorkerPool::on_fatal`]. The process-exit policy lives in one
//! place, [`ExitProcessOnFatal`].

use crate::engine::{MediaEngineGateway, WorkerEvent, WorkerId, WorkerSettings};
use crate::errors::SfuError;
use crate::observability::metrics;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const FATAL_CHANNEL_CAPACITY: usize = 16;

/// Handle to one engine worker.
#[derive(Debug)]
pub struct EngineWorker {
    id: WorkerId,
    alive: AtomicBool,
}

impl EngineWorker {
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Notification that a worker died unexpectedly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFatal {
    pub worker_id: WorkerId,
    pub reason: String,
}

/// Reaction to a fatal worker death.
#[async_trait]
pub trait FatalHandler: Send + Sync {
    async fn on_fatal(&self, fatal: WorkerFatal);
}

/// Logs the death, waits `grace`, then exits the process with status 1 so
/// an external supervisor restarts it.
#[derive(Debug, Clone)]
pub struct ExitProcessOnFatal {
    grace: Duration,
}

impl ExitProcessOnFatal {
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait]
impl FatalHandler for ExitProcessOnFatal {
    async fn on_fatal(&self, fatal: WorkerFatal) {
        error!(
            target: "sfu.workers",
            worker_id = fatal.worker_id,
            reason = %fatal.reason,
            grace_ms = u64::try_from(self.grace.as_millis()).unwrap_or(u64::MAX),
            "Engine worker died, exiting process"
        );
        tokio::time::sleep(self.grace).await;
        std::process::exit(1);
    }
}

/// Fixed pool of engine workers with round-robin dispensing.
pub struct EngineWorkerPool {
    gateway: MediaEngineGateway,
    workers: Vec<Arc<EngineWorker>>,
    next: AtomicUsize,
    closed: AtomicBool,
    fatal_tx: broadcast::Sender<WorkerFatal>,
    cancel_token: CancellationToken,
    monitor: JoinHandle<()>,
}

impl EngineWorkerPool {
    /// Start `count` workers with `settings`.
    ///
    /// # Errors
    ///
    /// Fails with `Config` when `count` is zero, or with the engine error of
    /// the first worker that fails to start (workers already started are
    /// closed again).
    pub async fn initialize(
        gateway: MediaEngineGateway,
        count: usize,
        settings: &WorkerSettings,
    ) -> Result<Arc<Self>, SfuError> {
        if count == 0 {
            return Err(SfuError::Config(
                "worker pool needs at least one worker".to_string(),
            ));
        }

        // Subscribe before starting workers so no death goes unseen.
        let events = gateway.subscribe_events();

        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            match gateway.create_worker(settings).await {
                Ok(id) => {
                    debug!(target: "sfu.workers", worker_id = id, "Engine worker started");
                    workers.push(Arc::new(EngineWorker {
                        id,
                        alive: AtomicBool::new(true),
                    }));
                }
                Err(e) => {
                    error!(
                        target: "sfu.workers",
                        error = %e,
                        started = workers.len(),
                        "Failed to start engine worker"
                    );
                    for worker in &workers {
                        let _ = gateway.close_worker(worker.id).await;
                    }
                    return Err(e.into());
                }
            }
        }

        let (fatal_tx, _) = broadcast::channel(FATAL_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();
        let monitor = tokio::spawn(monitor_workers(
            events,
            workers.clone(),
            fatal_tx.clone(),
            cancel_token.clone(),
        ));

        info!(
            target: "sfu.workers",
            worker_count = workers.len(),
            "Engine worker pool initialized"
        );

        Ok(Arc::new(Self {
            gateway,
            workers,
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            fatal_tx,
            cancel_token,
            monitor,
        }))
    }

    /// Next worker in round-robin order. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns `Draining` after `shutdown`.
    pub fn next_worker(&self) -> Result<Arc<EngineWorker>, SfuError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SfuError::Draining);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers
            .get(index)
            .cloned()
            .ok_or_else(|| SfuError::Internal("worker index out of range".to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    #[must_use]
    pub fn workers(&self) -> &[Arc<EngineWorker>] {
        &self.workers
    }

    /// Receive every future [`WorkerFatal`].
    #[must_use]
    pub fn subscribe_fatal(&self) -> broadcast::Receiver<WorkerFatal> {
        self.fatal_tx.subscribe()
    }

    /// Run `handler` for every future worker death.
    pub fn on_fatal(&self, handler: Arc<dyn FatalHandler>) -> JoinHandle<()> {
        let mut fatal_rx = self.fatal_tx.subscribe();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    fatal = fatal_rx.recv() => match fatal {
                        Ok(fatal) => handler.on_fatal(fatal).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(target: "sfu.workers", missed = missed, "Fatal handler lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Close every worker. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            target: "sfu.workers",
            worker_count = self.workers.len(),
            "Shutting down engine worker pool"
        );

        // Stop treating worker exits as fatal before closing them.
        self.cancel_token.cancel();

        for worker in &self.workers {
            worker.alive.store(false, Ordering::SeqCst);
            if let Err(e) = self.gateway.close_worker(worker.id).await {
                warn!(
                    target: "sfu.workers",
                    worker_id = worker.id,
                    error = %e,
                    "Failed to close engine worker"
                );
            }
        }
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for EngineWorkerPool {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.monitor.abort();
    }
}

#[instrument(skip_all, name = "sfu.workers.monitor")]
async fn monitor_workers(
    mut events: broadcast::Receiver<WorkerEvent>,
    workers: Vec<Arc<EngineWorker>>,
    fatal_tx: broadcast::Sender<WorkerFatal>,
    cancel_token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel_token.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(WorkerEvent::Died { worker_id, reason }) => {
                let Some(worker) = workers.iter().find(|w| w.id == worker_id) else {
                    continue;
                };
                worker.alive.store(false, Ordering::SeqCst);
                metrics::record_worker_death();
                error!(
                    target: "sfu.workers",
                    worker_id = worker_id,
                    reason = %reason,
                    "Engine worker died unexpectedly"
                );
                let _ = fatal_tx.send(WorkerFatal { worker_id, reason });
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(target: "sfu.workers", missed = missed, "Worker event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    debug!(target: "sfu.workers", "Worker monitor stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::engine::{EngineOp, LoopbackEngine};
    use crate::errors::EngineError;
    use std::collections::HashSet;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: 40000,
            rtc_max_port: 40100,
            log_level: "warn".to_string(),
        }
    }

    async fn pool(count: usize) -> (Arc<LoopbackEngine>, Arc<EngineWorkerPool>) {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = MediaEngineGateway::new(engine.clone());
        let pool = EngineWorkerPool::initialize(gateway, count, &settings())
            .await
            .unwrap();
        (engine, pool)
    }

    #[tokio::test]
    async fn test_initialize_starts_requested_workers() {
        let (engine, pool) = pool(4).await;
        assert_eq!(pool.len(), 4);
        assert_eq!(engine.call_count(EngineOp::CreateWorker), 4);
        assert!(pool.workers().iter().all(|w| w.is_alive()));
    }

    #[tokio::test]
    async fn test_initialize_rejects_zero_workers() {
        let engine = Arc::new(LoopbackEngine::new());
        let result = EngineWorkerPool::initialize(MediaEngineGateway::new(engine), 0, &settings()).await;
        assert!(matches!(result, Err(SfuError::Config(_))));
    }

    #[tokio::test]
    async fn test_initialize_propagates_engine_failure() {
        let engine = Arc::new(LoopbackEngine::new());
        engine.fail_next(EngineOp::CreateWorker, EngineError::Unavailable);
        let result =
            EngineWorkerPool::initialize(MediaEngineGateway::new(engine.clone()), 3, &settings())
                .await;

        assert!(matches!(result, Err(SfuError::Engine(EngineError::Unavailable))));
        assert_eq!(engine.call_count(EngineOp::CreateWorker), 1);
    }

    #[tokio::test]
    async fn test_next_worker_round_robin() {
        let (_engine, pool) = pool(3).await;

        let ids: Vec<WorkerId> = (0..6).map(|_| pool.next_worker().unwrap().id()).collect();
        let first_cycle: HashSet<_> = ids.iter().take(3).copied().collect();

        assert_eq!(first_cycle.len(), 3);
        assert_eq!(&ids[..3], &ids[3..]);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (engine, pool) = pool(2).await;

        pool.shutdown().await;
        pool.shutdown().await;

        assert!(pool.is_shut_down());
        assert_eq!(engine.call_count(EngineOp::CloseWorker), 2);
        assert!(matches!(pool.next_worker(), Err(SfuError::Draining)));
    }

    #[tokio::test]
    async fn test_worker_death_notifies_subscribers() {
        let (engine, pool) = pool(2).await;
        let mut fatal_rx = pool.subscribe_fatal();
        let victim = pool.workers().first().unwrap().id();

        engine.kill_worker(victim);

        let fatal = fatal_rx.recv().await.unwrap();
        assert_eq!(fatal.worker_id, victim);
        assert!(!pool.workers().first().unwrap().is_alive());
    }

    struct Recording(tokio::sync::mpsc::UnboundedSender<WorkerFatal>);

    #[async_trait]
    impl FatalHandler for Recording {
        async fn on_fatal(&self, fatal: WorkerFatal) {
            let _ = self.0.send(fatal);
        }
    }

    #[tokio::test]
    async fn test_on_fatal_handler_invoked_once_per_death() {
        let (engine, pool) = pool(2).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _task = pool.on_fatal(Arc::new(Recording(tx)));

        let victim = pool.workers().get(1).unwrap().id();
        engine.kill_worker(victim);

        let fatal = rx.recv().await.unwrap();
        assert_eq!(fatal.worker_id, victim);
        assert!(rx.try_recv().is_err());
    }
}
