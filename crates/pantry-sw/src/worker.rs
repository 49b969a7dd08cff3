//! The worker event loop.
//!
//! A [`ServiceWorker`] is one deployment: its config, its cache bucket and
//! the components built over them. [`ServiceWorker::spawn`] starts the loop
//! and returns the [`WorkerHandle`] the host dispatches events through. Every
//! event runs as its own task and answers on a oneshot, so the sender knows
//! exactly when the work it started has finished.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::cache::{CacheStorage, CacheVersion};
use crate::config::WorkerConfig;
use crate::lifecycle::{ActivationReport, InstallReport, LifecycleController, WorkerState};
use crate::messenger::{ClientMessage, ClientMessenger};
use crate::network::{NetError, Network};
use crate::push::{ClickOutcome, NotificationClick, Notifier, PushNotificationService, PushOutcome};
use crate::registration::Registration;
use crate::request::{Request, Response};
use crate::router::RequestRouter;
use crate::ServiceWorkerError;

// ==================== Identity ====================

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

// ==================== Context ====================

/// Host services shared by every worker of a registration.
#[derive(Clone)]
pub struct WorkerContext {
    pub caches: Arc<CacheStorage>,
    pub network: Arc<dyn Network>,
    pub notifier: Arc<dyn Notifier>,
    pub messenger: Arc<ClientMessenger>,
}

// ==================== Events ====================

pub(crate) enum WorkerEvent {
    Install {
        done: oneshot::Sender<Result<InstallReport, ServiceWorkerError>>,
    },
    Activate {
        done: oneshot::Sender<Result<ActivationReport, ServiceWorkerError>>,
    },
    Fetch {
        request: Request,
        respond: oneshot::Sender<Result<Option<Response>, NetError>>,
    },
    Push {
        data: Option<Bytes>,
        done: oneshot::Sender<PushOutcome>,
    },
    NotificationClick {
        click: NotificationClick,
        done: oneshot::Sender<Result<ClickOutcome, ServiceWorkerError>>,
    },
    Message {
        data: JsonValue,
    },
}

impl WorkerEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Install { .. } => "install",
            Self::Activate { .. } => "activate",
            Self::Fetch { .. } => "fetch",
            Self::Push { .. } => "push",
            Self::NotificationClick { .. } => "notificationclick",
            Self::Message { .. } => "message",
        }
    }
}

// ==================== Worker ====================

/// One deployment of the worker.
pub struct ServiceWorker {
    id: WorkerId,
    config: WorkerConfig,
    lifecycle: LifecycleController,
    router: RequestRouter,
    push: PushNotificationService,
}

impl ServiceWorker {
    /// Build a worker for `config` over the host services in `ctx`.
    pub fn new(config: WorkerConfig, ctx: WorkerContext) -> Result<Arc<Self>, ServiceWorkerError> {
        config.validate()?;

        let id = WorkerId::next();
        let lifecycle = LifecycleController::new(
            id,
            &config,
            ctx.caches.clone(),
            ctx.network.clone(),
            ctx.messenger.clone(),
        )?;
        let router = RequestRouter::new(
            config.routes.clone(),
            config.cache_version(),
            ctx.caches,
            ctx.network,
        );
        let push = PushNotificationService::new(
            id,
            config.origin_url()?,
            config.notifications.clone(),
            ctx.notifier,
            ctx.messenger,
        );

        debug!(worker = %id, version = %config.cache_version(), "Created service worker");
        Ok(Arc::new(Self {
            id,
            config,
            lifecycle,
            router,
            push,
        }))
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn version(&self) -> &CacheVersion {
        self.lifecycle.version()
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    /// Start the event loop.
    ///
    /// The loop lives until every handle is dropped. `registration` is the
    /// owner the worker reports skip-waiting to; a dangling `Weak` is fine
    /// for a worker running on its own.
    pub fn spawn(self: Arc<Self>, registration: Weak<Registration>) -> WorkerHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let handle = WorkerHandle {
            id: self.id,
            version: self.version().clone(),
            state: self.lifecycle.state_channel(),
            tx,
        };

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                trace!(worker = %self.id, event = event.name(), "Dispatching event");
                let worker = self.clone();
                let registration = registration.clone();
                tokio::spawn(async move { worker.handle_event(event, registration).await });
            }
            debug!(worker = %self.id, "Event loop stopped");
        });

        handle
    }

    async fn handle_event(&self, event: WorkerEvent, registration: Weak<Registration>) {
        // A dropped receiver means the host stopped waiting; nothing to do.
        match event {
            WorkerEvent::Install { done } => {
                let _ = done.send(self.lifecycle.install().await);
            }
            WorkerEvent::Activate { done } => {
                let _ = done.send(self.lifecycle.activate().await);
            }
            WorkerEvent::Fetch { request, respond } => {
                let _ = respond.send(self.router.handle(&request).await);
            }
            WorkerEvent::Push { data, done } => {
                let _ = done.send(self.push.on_push(data.as_deref()).await);
            }
            WorkerEvent::NotificationClick { click, done } => {
                let _ = done.send(self.push.on_notification_click(click).await);
            }
            WorkerEvent::Message { data } => self.on_message(data, registration).await,
        }
    }

    async fn on_message(&self, data: JsonValue, registration: Weak<Registration>) {
        match ClientMessage::parse(&data) {
            Some(ClientMessage::SkipWaiting) => {
                let Some(registration) = registration.upgrade() else {
                    warn!(worker = %self.id, "SKIP_WAITING without a registration");
                    return;
                };
                if let Err(e) = registration.skip_waiting(self.id).await {
                    warn!(worker = %self.id, error = %e, "Skip waiting failed");
                }
            }
            Some(ClientMessage::ShowTestNotification { data }) => {
                self.push.on_test_notification(data).await;
            }
            Some(other) => trace!(worker = %self.id, message = ?other, "Ignoring message"),
            None => {}
        }
    }
}

// ==================== Handle ====================

/// Host-side handle to a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    version: CacheVersion,
    state: Arc<watch::Sender<WorkerState>>,
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("state", &self.state())
            .finish()
    }
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn version(&self) -> &CacheVersion {
        &self.version
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Whether the event loop is still running.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// `postMessage` a protocol message to the worker.
    pub fn post_message(&self, message: &ClientMessage) -> Result<(), ServiceWorkerError> {
        self.post_value(message.to_value())
    }

    /// `postMessage` an arbitrary value; shapes the worker does not know are
    /// ignored on its side.
    pub fn post_value(&self, data: JsonValue) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(WorkerEvent::Message { data })
            .map_err(|_| self.terminated())
    }

    pub(crate) async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        self.dispatch(|done| WorkerEvent::Install { done }).await?
    }

    pub(crate) async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        self.dispatch(|done| WorkerEvent::Activate { done }).await?
    }

    /// Dispatch a fetch. A worker that is gone does not intercept.
    pub async fn fetch(&self, request: Request) -> Result<Option<Response>, NetError> {
        match self
            .dispatch(|respond| WorkerEvent::Fetch { request, respond })
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(worker = %self.id, error = %e, "Fetch not dispatched");
                Ok(None)
            }
        }
    }

    pub async fn push(&self, data: Option<Bytes>) -> Result<PushOutcome, ServiceWorkerError> {
        self.dispatch(|done| WorkerEvent::Push { data, done }).await
    }

    pub async fn notification_click(
        &self,
        click: NotificationClick,
    ) -> Result<ClickOutcome, ServiceWorkerError> {
        self.dispatch(|done| WorkerEvent::NotificationClick { click, done })
            .await?
    }

    pub(crate) fn mark_redundant(&self) {
        self.state.send_replace(WorkerState::Redundant);
    }

    async fn dispatch<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WorkerEvent,
    ) -> Result<T, ServiceWorkerError> {
        let (done, rx) = oneshot::channel();
        self.tx.send(make(done)).map_err(|_| self.terminated())?;
        rx.await.map_err(|_| self.terminated())
    }

    fn terminated(&self) -> ServiceWorkerError {
        ServiceWorkerError::StateError(format!("worker {} is not running", self.id))
    }
}
