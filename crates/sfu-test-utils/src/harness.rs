//! End-to-end harness: a full `SfuService` on a `LoopbackEngine`, plus
//! scripted clients that speak the JSON signaling protocol through a real
//! `ConnectionActor` (no socket).

use crate::fixtures::{TestUser, TEST_JWT_SECRET};

use async_trait::async_trait;
use serde_json::{json, Value};
use sfu_service::actors::ConnectionActor;
use sfu_service::actors::ConnectionActorHandle;
use sfu_service::config::Config;
use sfu_service::directory::InMemoryDirectory;
use sfu_service::engine::LoopbackEngine;
use sfu_service::workers::{FatalHandler, WorkerFatal};
use sfu_service::SfuService;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long a client waits for a frame before failing the test.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for [`TestSfu`].
#[derive(Clone)]
pub struct TestSfuBuilder {
    workers: usize,
    auto_provision: bool,
    max_participants: usize,
    engine: Option<Arc<LoopbackEngine>>,
}

impl Default for TestSfuBuilder {
    fn default() -> Self {
        Self {
            workers: 2,
            auto_provision: true,
            max_participants: 100,
            engine: None,
        }
    }
}

impl TestSfuBuilder {
    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    #[must_use]
    pub fn max_participants(mut self, max: usize) -> Self {
        self.max_participants = max;
        self
    }

    /// Unknown meeting ids are rejected instead of auto-provisioned.
    #[must_use]
    pub fn without_auto_provision(mut self) -> Self {
        self.auto_provision = false;
        self
    }

    /// Use a pre-configured engine (latency, fault injection).
    #[must_use]
    pub fn engine(mut self, engine: Arc<LoopbackEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// # Panics
    ///
    /// Panics if the service fails to start.
    pub async fn build(self) -> TestSfu {
        let vars = HashMap::from([
            ("SFU_JWT_SECRET".to_string(), TEST_JWT_SECRET.to_string()),
            ("SFU_ID".to_string(), "sfu-test".to_string()),
            ("SFU_WORKER_COUNT".to_string(), self.workers.to_string()),
            (
                "SFU_AUTO_PROVISION_MEETINGS".to_string(),
                self.auto_provision.to_string(),
            ),
            (
                "SFU_DEFAULT_MAX_PARTICIPANTS".to_string(),
                self.max_participants.to_string(),
            ),
        ]);
        let config = Config::from_vars(&vars).expect("test config is valid");

        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(LoopbackEngine::new()));
        let directory = Arc::new(
            InMemoryDirectory::new(config.auto_provision_meetings, config.default_max_participants)
                .with_bcrypt_cost(4),
        );

        let service = SfuService::start(&config, engine.clone(), directory.clone())
            .await
            .expect("service failed to start");

        TestSfu {
            engine,
            directory,
            service,
        }
    }
}

/// A running SFU on the loopback engine.
pub struct TestSfu {
    pub engine: Arc<LoopbackEngine>,
    pub directory: Arc<InMemoryDirectory>,
    pub service: SfuService,
}

impl TestSfu {
    /// Start with the default builder settings.
    pub async fn start() -> Self {
        Self::builder().build().await
    }

    #[must_use]
    pub fn builder() -> TestSfuBuilder {
        TestSfuBuilder::default()
    }

    /// Open a signaling connection as `user_id`.
    #[must_use]
    pub fn connect(&self, user_id: &str) -> TestClient {
        self.connect_as(&TestUser::new(user_id))
    }

    #[must_use]
    pub fn connect_as(&self, user: &TestUser) -> TestClient {
        let (outbound, frames) = mpsc::channel(256);
        let connection_id = format!("conn-{}", Uuid::new_v4());
        let (handle, task) = ConnectionActor::spawn(
            connection_id,
            user.identity(),
            self.service.session_context(),
            outbound,
            CancellationToken::new(),
            Arc::clone(self.service.metrics()),
        );
        TestClient {
            handle,
            task: Some(task),
            frames,
            next_id: 1,
            events: VecDeque::new(),
        }
    }
}

/// A scripted signaling client.
pub struct TestClient {
    handle: ConnectionActorHandle,
    task: Option<JoinHandle<()>>,
    frames: mpsc::Receiver<String>,
    next_id: u64,
    /// Events received while waiting for a reply.
    events: VecDeque<Value>,
}

impl TestClient {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        self.handle.connection_id()
    }

    async fn next_frame(&mut self) -> Value {
        let text = tokio::time::timeout(FRAME_TIMEOUT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed");
        serde_json::from_str(&text).expect("server sent invalid JSON")
    }

    /// Send a request and return its reply. Events that arrive first are
    /// kept for [`TestClient::next_event`].
    ///
    /// # Panics
    ///
    /// Panics if no reply arrives within [`FRAME_TIMEOUT`].
    pub async fn request(&mut self, message_type: &str, data: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;

        let frame = if data.is_null() {
            json!({"id": id, "type": message_type})
        } else {
            json!({"id": id, "type": message_type, "data": data})
        };
        self.handle
            .deliver(frame.to_string())
            .await
            .expect("connection actor stopped");

        loop {
            let frame = self.next_frame().await;
            if frame.get("event").is_some() {
                self.events.push_back(frame);
                continue;
            }
            assert_eq!(frame.get("id"), Some(&json!(id)), "reply out of order: {frame}");
            return frame;
        }
    }

    /// Send raw text as a frame and return the next reply.
    pub async fn send_raw(&mut self, text: &str) -> Value {
        self.handle
            .deliver(text.to_string())
            .await
            .expect("connection actor stopped");
        loop {
            let frame = self.next_frame().await;
            if frame.get("event").is_some() {
                self.events.push_back(frame);
                continue;
            }
            return frame;
        }
    }

    /// Join `meeting_id` and return the reply data.
    pub async fn join(&mut self, meeting_id: &str) -> Value {
        let reply = self
            .request("join-meeting", json!({"meetingId": meeting_id}))
            .await;
        assert_success(&reply).clone()
    }

    /// Next room event.
    ///
    /// # Panics
    ///
    /// Panics on timeout or if a reply arrives instead.
    pub async fn next_event(&mut self) -> Value {
        if let Some(event) = self.events.pop_front() {
            return event;
        }
        let frame = self.next_frame().await;
        assert!(frame.get("event").is_some(), "expected an event, got {frame}");
        frame
    }

    /// Skip events until one named `name` arrives.
    pub async fn next_event_named(&mut self, name: &str) -> Value {
        loop {
            let event = self.next_event().await;
            if event.get("event") == Some(&json!(name)) {
                return event;
            }
        }
    }

    /// The next event if one arrives within `within`.
    pub async fn try_event(&mut self, within: Duration) -> Option<Value> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        match tokio::time::timeout(within, self.frames.recv()).await {
            Ok(Some(text)) => serde_json::from_str(&text).ok(),
            Ok(None) | Err(_) => None,
        }
    }

    /// Simulate the socket closing without `leave-meeting`, and wait for the
    /// actor to finish its teardown.
    pub async fn disconnect(&mut self) {
        let _ = self.handle.close("test disconnect".to_string()).await;
        if let Some(task) = self.task.take() {
            task.await.expect("connection actor panicked");
        }
    }
}

/// Assert a successful reply and return its `data` (null for a plain ack).
///
/// # Panics
///
/// Panics if the reply is an error.
pub fn assert_success(reply: &Value) -> &Value {
    assert_eq!(
        reply.get("success"),
        Some(&json!(true)),
        "expected success, got {reply}"
    );
    reply.get("data").unwrap_or(&Value::Null)
}

/// Assert a failed reply with `code`.
///
/// # Panics
///
/// Panics if the reply succeeded or carries another code.
pub fn assert_error_code(reply: &Value, code: &str) {
    assert_eq!(
        reply.get("success"),
        Some(&json!(false)),
        "expected failure, got {reply}"
    );
    assert_eq!(
        reply.pointer("/error/code"),
        Some(&json!(code)),
        "unexpected error in {reply}"
    );
}

/// `FatalHandler` that records deaths instead of exiting.
pub struct RecordingFatalHandler {
    tx: mpsc::UnboundedSender<WorkerFatal>,
}

impl RecordingFatalHandler {
    #[must_use]
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<WorkerFatal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl FatalHandler for RecordingFatalHandler {
    async fn on_fatal(&self, fatal: WorkerFatal) {
        let _ = self.tx.send(fatal);
    }
}
