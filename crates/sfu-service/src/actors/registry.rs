//! `RoomRegistryActor` - singleton owner of every room in the process.
//!
//! - Maps meeting id → `RoomActor`
//! - Creates rooms lazily on first join, one router per room
//! - Owns the root `CancellationToken`; rooms get child tokens
//! - Monitors room actor health (panic detection via `JoinHandle`)
//!
//! # Single-flight creation
//!
//! The first `get_or_create` for a meeting inserts a `Creating` slot, picks a
//! worker and starts router creation in a spawned task. Concurrent callers for
//! the same meeting queue on the slot and all receive the same room once the
//! router exists. Router creation does not block the mailbox, so other
//! meetings are served meanwhile.
//!
//! Rooms are never removed because they became empty; only `remove` and
//! `shutdown` close them.

use crate::engine::{MediaEngineGateway, RouterInfo, RtpCodecCapability, TransportOptions};
use crate::errors::SfuError;
use crate::workers::EngineWorkerPool;

use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomHandle};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long `remove` waits for a room task to finish after closing it.
const ROOM_REMOVAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for each room task.
const ROOM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// What every room is created with.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// Codecs offered by each room's router.
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Options for every transport a room creates.
    pub transport_options: TransportOptions,
}

/// Handle to the `RoomRegistryActor`.
#[derive(Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Spawn the registry actor and return a handle to it.
    #[must_use]
    pub fn new(
        sfu_id: String,
        pool: Arc<EngineWorkerPool>,
        gateway: MediaEngineGateway,
        settings: RoomSettings,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor {
            mailbox: MailboxMonitor::new(ActorType::Registry, &sfu_id),
            sfu_id,
            receiver,
            completions: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            accepting_new: true,
            pool,
            gateway,
            media_codecs: Arc::from(settings.media_codecs),
            transport_options: Arc::new(settings.transport_options),
            metrics,
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Return the meeting's room, creating it (and its router) if needed.
    ///
    /// Concurrent calls for the same meeting resolve to the same room.
    pub async fn get_or_create(&self, meeting_id: String) -> Result<RoomHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreate {
                meeting_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn get(&self, meeting_id: String) -> Result<Option<RoomHandle>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Get {
                meeting_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Close the room and deregister it. Resolves once the room's teardown
    /// finished (or timed out).
    pub async fn remove(&self, meeting_id: String) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Remove {
                meeting_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Meeting ids of every active room, sorted.
    pub async fn list(&self) -> Result<Vec<String>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::List { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting rooms and close every room. The registry keeps
    /// answering requests afterwards (`get_or_create` fails with `Draining`).
    pub async fn shutdown(&self) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the registry and every room (immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Child token for actors that must stop with the registry.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

type Waiter = oneshot::Sender<Result<RoomHandle, SfuError>>;

struct ManagedRoom {
    handle: RoomHandle,
    task_handle: JoinHandle<()>,
    created_at: i64,
}

enum RoomSlot {
    /// Router creation in flight; callers waiting for the room.
    Creating(Vec<Waiter>),
    Ready(ManagedRoom),
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    sfu_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    completions: mpsc::WeakSender<RegistryMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<String, RoomSlot>,
    accepting_new: bool,
    pool: Arc<EngineWorkerPool>,
    gateway: MediaEngineGateway,
    media_codecs: Arc<[RtpCodecCapability]>,
    transport_options: Arc<TransportOptions>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    #[instrument(skip_all, name = "sfu.actor.registry", fields(sfu_id = %self.sfu_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            "RoomRegistryActor started"
        );

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.registry",
                                sfu_id = %self.sfu_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreate {
                meeting_id,
                respond_to,
            } => {
                self.get_or_create(meeting_id, respond_to);
            }

            RegistryMessage::Get {
                meeting_id,
                respond_to,
            } => {
                let room = match self.rooms.get(&meeting_id) {
                    Some(RoomSlot::Ready(managed)) => Some(managed.handle.clone()),
                    _ => None,
                };
                let _ = respond_to.send(room);
            }

            RegistryMessage::Remove {
                meeting_id,
                respond_to,
            } => {
                self.remove(&meeting_id, respond_to);
            }

            RegistryMessage::List { respond_to } => {
                let mut ids: Vec<String> = self
                    .rooms
                    .iter()
                    .filter(|(_, slot)| matches!(slot, RoomSlot::Ready(_)))
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.sort();
                let _ = respond_to.send(ids);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown { respond_to } => {
                self.graceful_shutdown().await;
                let _ = respond_to.send(Ok(()));
            }

            RegistryMessage::RoomCreated { meeting_id, result } => {
                self.room_created(meeting_id, result);
            }
        }
    }

    fn get_or_create(&mut self, meeting_id: String, respond_to: Waiter) {
        if !self.accepting_new {
            let _ = respond_to.send(Err(SfuError::Draining));
            return;
        }

        match self.rooms.get_mut(&meeting_id) {
            Some(RoomSlot::Ready(managed)) => {
                let _ = respond_to.send(Ok(managed.handle.clone()));
                return;
            }
            Some(RoomSlot::Creating(waiters)) => {
                debug!(
                    target: "sfu.actor.registry",
                    meeting_id = %meeting_id,
                    "Room creation in flight, queueing caller"
                );
                waiters.push(respond_to);
                return;
            }
            None => {}
        }

        let worker = match self.pool.next_worker() {
            Ok(worker) => worker,
            Err(e) => {
                let _ = respond_to.send(Err(e));
                return;
            }
        };

        debug!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            meeting_id = %meeting_id,
            worker_id = worker.id(),
            "Creating router for new room"
        );

        self.rooms
            .insert(meeting_id.clone(), RoomSlot::Creating(vec![respond_to]));

        let gateway = self.gateway.clone();
        let codecs = Arc::clone(&self.media_codecs);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = gateway
                .create_router(worker.id(), &codecs)
                .await
                .map_err(SfuError::from);

            let undelivered = match completions.upgrade() {
                Some(sender) => match sender
                    .send(RegistryMessage::RoomCreated { meeting_id, result })
                    .await
                {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(message)) => message,
                },
                None => RegistryMessage::RoomCreated { meeting_id, result },
            };
            // Registry is gone; the router has no owner.
            if let RegistryMessage::RoomCreated {
                result: Ok(router),
                ..
            } = undelivered
            {
                let _ = gateway.close_router(&router.id).await;
            }
        });
    }

    fn room_created(&mut self, meeting_id: String, result: Result<RouterInfo, SfuError>) {
        let waiters = match self.rooms.remove(&meeting_id) {
            Some(RoomSlot::Creating(waiters)) => waiters,
            other => {
                // Removed (or shut down) while the router was being created.
                if let Some(slot) = other {
                    self.rooms.insert(meeting_id.clone(), slot);
                }
                if let Ok(router) = result {
                    debug!(
                        target: "sfu.actor.registry",
                        meeting_id = %meeting_id,
                        router_id = %router.id,
                        "Closing router of abandoned room creation"
                    );
                    self.close_router_detached(router.id);
                }
                return;
            }
        };

        let router = match result {
            Ok(router) => router,
            Err(e) => {
                warn!(
                    target: "sfu.actor.registry",
                    sfu_id = %self.sfu_id,
                    meeting_id = %meeting_id,
                    error = %e,
                    "Router creation failed"
                );
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
                return;
            }
        };

        let (handle, task_handle) = RoomActor::spawn(
            meeting_id.clone(),
            router,
            self.gateway.clone(),
            Arc::clone(&self.transport_options),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        for waiter in waiters {
            let _ = waiter.send(Ok(handle.clone()));
        }

        self.rooms.insert(
            meeting_id.clone(),
            RoomSlot::Ready(ManagedRoom {
                handle,
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
            }),
        );
        self.metrics.room_created();

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            meeting_id = %meeting_id,
            total_rooms = self.metrics.room_count(),
            "Room created"
        );
    }

    /// Deregister the room now; close it in the background and reply when
    /// the close finished.
    fn remove(&mut self, meeting_id: &str, respond_to: oneshot::Sender<Result<(), SfuError>>) {
        match self.rooms.remove(meeting_id) {
            Some(RoomSlot::Ready(managed)) => {
                self.metrics.room_removed();

                info!(
                    target: "sfu.actor.registry",
                    sfu_id = %self.sfu_id,
                    meeting_id = %meeting_id,
                    age_secs = chrono::Utc::now().timestamp() - managed.created_at,
                    "Removing room"
                );

                let meeting_id = meeting_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = managed.handle.close().await {
                        // Actor already stopped; nothing left to close.
                        debug!(
                            target: "sfu.actor.registry",
                            meeting_id = %meeting_id,
                            error = %e,
                            "Room close request not delivered"
                        );
                    }
                    match tokio::time::timeout(ROOM_REMOVAL_TIMEOUT, managed.task_handle).await {
                        Ok(Ok(())) => {
                            debug!(
                                target: "sfu.actor.registry",
                                meeting_id = %meeting_id,
                                "Room actor task completed cleanly"
                            );
                        }
                        Ok(Err(e)) => {
                            warn!(
                                target: "sfu.actor.registry",
                                meeting_id = %meeting_id,
                                error = ?e,
                                "Room actor task panicked during removal"
                            );
                        }
                        Err(_) => {
                            warn!(
                                target: "sfu.actor.registry",
                                meeting_id = %meeting_id,
                                "Room actor task cleanup timed out"
                            );
                            managed.handle.cancel();
                        }
                    }
                    let _ = respond_to.send(Ok(()));
                });
            }
            Some(RoomSlot::Creating(waiters)) => {
                for waiter in waiters {
                    let _ = waiter.send(Err(SfuError::RoomNotFound(meeting_id.to_string())));
                }
                let _ = respond_to.send(Ok(()));
            }
            None => {
                let _ = respond_to.send(Err(SfuError::RoomNotFound(meeting_id.to_string())));
            }
        }
    }

    fn get_status(&self) -> RegistryStatus {
        let creating = self
            .rooms
            .values()
            .filter(|slot| matches!(slot, RoomSlot::Creating(_)))
            .count();
        RegistryStatus {
            room_count: self.rooms.len() - creating,
            creating,
            is_draining: !self.accepting_new,
            mailbox_depth: self.receiver.len(),
        }
    }

    fn close_router_detached(&self, router_id: String) {
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.close_router(&router_id).await {
                warn!(
                    target: "sfu.actor.registry",
                    router_id = %router_id,
                    error = %e,
                    "Failed to close router"
                );
            }
        });
    }

    /// Stop accepting rooms, cancel every room and wait for them to finish.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        let mut ready = Vec::new();
        for (meeting_id, slot) in self.rooms.drain() {
            match slot {
                RoomSlot::Creating(waiters) => {
                    for waiter in waiters {
                        let _ = waiter.send(Err(SfuError::Draining));
                    }
                }
                RoomSlot::Ready(managed) => {
                    debug!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        meeting_id = %meeting_id,
                        "Cancelling room actor"
                    );
                    managed.handle.cancel();
                    ready.push((meeting_id, managed));
                }
            }
        }

        for (meeting_id, managed) in ready {
            match tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        meeting_id = %meeting_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        meeting_id = %meeting_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        meeting_id = %meeting_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            "Graceful shutdown complete"
        );
    }

    /// Drop rooms whose actor task ended without being removed.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter_map(|(meeting_id, slot)| match slot {
                RoomSlot::Ready(managed) if managed.task_handle.is_finished() => {
                    Some(meeting_id.clone())
                }
                _ => None,
            })
            .collect();

        for meeting_id in finished {
            let Some(RoomSlot::Ready(managed)) = self.rooms.remove(&meeting_id) else {
                continue;
            };
            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        meeting_id = %meeting_id,
                        "Room actor exited on its own"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "sfu.actor.registry",
                            sfu_id = %self.sfu_id,
                            meeting_id = %meeting_id,
                            error = ?join_error,
                            "Room actor panicked - room lost"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }
            self.metrics.room_removed();
        }
    }
}
