//! The host-held registration.
//!
//! ```text
//! update() ──► UpdateChecker ──► install(worker)
//!                                   │
//!               installing ─────────┘
//!                   │ install event done
//!                   ▼
//!               waiting ── nothing active, or SKIP_WAITING ──► active
//! ```
//!
//! Slot changes are serialized by one transition lock. Fetches are only
//! dispatched to an active worker that has reached [`WorkerState::Activated`].

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheVersion;
use crate::config::WorkerConfig;
use crate::lifecycle::{ActivationReport, WorkerState};
use crate::network::NetError;
use crate::push::{ClickOutcome, NotificationClick, PushOutcome};
use crate::request::{Request, Response};
use crate::worker::{ServiceWorker, WorkerContext, WorkerHandle, WorkerId};
use crate::ServiceWorkerError;

const EVENT_CAPACITY: usize = 64;

/// Events observable by pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// A new worker entered the installing slot (`updatefound`).
    UpdateFound { worker: WorkerId },
    /// A worker reached a new state.
    StateChange { worker: WorkerId, state: WorkerState },
}

/// Decides whether a newer worker exists.
#[async_trait]
pub trait UpdateChecker: Send + Sync {
    /// Return a worker to install if the latest deployment differs from
    /// `current`, the newest version the registration already holds.
    async fn check(
        &self,
        current: Option<&CacheVersion>,
    ) -> Result<Option<Arc<ServiceWorker>>, ServiceWorkerError>;
}

/// Update checker fed with published deployments.
pub struct DeploymentChecker {
    ctx: WorkerContext,
    latest: RwLock<Option<WorkerConfig>>,
}

impl DeploymentChecker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            latest: RwLock::new(None),
        }
    }

    /// Make `config` the latest deployment.
    pub async fn publish(&self, config: WorkerConfig) {
        info!(version = %config.cache_version(), "Deployment published");
        *self.latest.write().await = Some(config);
    }
}

#[async_trait]
impl UpdateChecker for DeploymentChecker {
    async fn check(
        &self,
        current: Option<&CacheVersion>,
    ) -> Result<Option<Arc<ServiceWorker>>, ServiceWorkerError> {
        let latest = self.latest.read().await;
        let Some(config) = latest.as_ref() else {
            return Ok(None);
        };
        if current == Some(&config.cache_version()) {
            debug!(version = %config.cache_version(), "Already up to date");
            return Ok(None);
        }
        ServiceWorker::new(config.clone(), self.ctx.clone()).map(Some)
    }
}

#[derive(Default)]
struct Slots {
    installing: Option<WorkerHandle>,
    waiting: Option<WorkerHandle>,
    active: Option<WorkerHandle>,
}

/// A scope's installing, waiting and active workers.
pub struct Registration {
    scope: Url,
    this: Weak<Registration>,
    checker: Option<Arc<dyn UpdateChecker>>,
    slots: RwLock<Slots>,
    transition: Mutex<()>,
    events: broadcast::Sender<RegistrationEvent>,
}

impl Registration {
    pub fn new(scope: Url, checker: Option<Arc<dyn UpdateChecker>>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|this| Self {
            scope,
            this: this.clone(),
            checker,
            slots: RwLock::new(Slots::default()),
            transition: Mutex::new(()),
            events,
        })
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistrationEvent> {
        self.events.subscribe()
    }

    pub async fn installing(&self) -> Option<WorkerHandle> {
        self.slots.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<WorkerHandle> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<WorkerHandle> {
        self.slots.read().await.active.clone()
    }

    fn emit(&self, event: RegistrationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn retire(&self, handle: &WorkerHandle) {
        handle.mark_redundant();
        self.emit(RegistrationEvent::StateChange {
            worker: handle.id(),
            state: WorkerState::Redundant,
        });
    }

    /// Install `worker`. It waits afterwards unless nothing is active, in
    /// which case it is activated right away.
    pub async fn install(&self, worker: Arc<ServiceWorker>) -> Result<WorkerHandle, ServiceWorkerError> {
        let _transition = self.transition.lock().await;

        let handle = worker.spawn(self.this.clone());
        info!(worker = %handle.id(), version = %handle.version(), "Installing worker");
        self.slots.write().await.installing = Some(handle.clone());
        self.emit(RegistrationEvent::UpdateFound { worker: handle.id() });

        let installed = handle.install().await;
        self.slots.write().await.installing = None;
        if let Err(e) = installed {
            warn!(worker = %handle.id(), error = %e, "Install failed");
            self.retire(&handle);
            return Err(e);
        }

        let (replaced, has_active) = {
            let mut slots = self.slots.write().await;
            (slots.waiting.replace(handle.clone()), slots.active.is_some())
        };
        if let Some(previous) = replaced {
            debug!(worker = %previous.id(), "Replaced waiting worker");
            self.retire(&previous);
        }
        self.emit(RegistrationEvent::StateChange {
            worker: handle.id(),
            state: WorkerState::Installed,
        });

        if !has_active {
            self.activate_waiting().await?;
        }
        Ok(handle)
    }

    /// The skip-waiting handshake: activate `worker` if it is the one waiting.
    /// Returns `false` when it is not.
    pub async fn skip_waiting(&self, worker: WorkerId) -> Result<bool, ServiceWorkerError> {
        let _transition = self.transition.lock().await;

        let is_waiting = self
            .slots
            .read()
            .await
            .waiting
            .as_ref()
            .is_some_and(|waiting| waiting.id() == worker);
        if !is_waiting {
            debug!(worker = %worker, "Skip waiting from a worker that is not waiting");
            return Ok(false);
        }
        self.activate_waiting().await?;
        Ok(true)
    }

    /// Promote the waiting worker. Caller holds the transition lock.
    async fn activate_waiting(&self) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        let (incoming, outgoing) = {
            let mut slots = self.slots.write().await;
            let Some(incoming) = slots.waiting.take() else {
                return Ok(None);
            };
            let outgoing = slots.active.replace(incoming.clone());
            (incoming, outgoing)
        };
        if let Some(outgoing) = outgoing {
            self.retire(&outgoing);
        }

        match incoming.activate().await {
            Ok(report) => {
                self.emit(RegistrationEvent::StateChange {
                    worker: incoming.id(),
                    state: WorkerState::Activated,
                });
                Ok(Some(report))
            }
            Err(e) => {
                warn!(worker = %incoming.id(), error = %e, "Activation failed");
                let mut slots = self.slots.write().await;
                if slots.active.as_ref().is_some_and(|a| a.id() == incoming.id()) {
                    slots.active = None;
                }
                drop(slots);
                self.retire(&incoming);
                Err(e)
            }
        }
    }

    /// Ask the update checker for a newer worker and install it.
    ///
    /// Resolves once any newer worker has finished installing, so the caller
    /// can sample [`waiting`](Self::waiting) right after.
    pub async fn update(&self) -> Result<Option<WorkerHandle>, ServiceWorkerError> {
        let Some(checker) = self.checker.clone() else {
            return Ok(None);
        };
        let current = {
            let slots = self.slots.read().await;
            slots
                .waiting
                .as_ref()
                .or(slots.active.as_ref())
                .map(|handle| handle.version().clone())
        };
        match checker.check(current.as_ref()).await? {
            Some(worker) => self.install(worker).await.map(Some),
            None => Ok(None),
        }
    }

    /// Dispatch a page fetch.
    ///
    /// `Ok(None)` means no worker intercepts and the host fetches on its own.
    /// While the active worker is still activating the fetch waits for it.
    pub async fn fetch(&self, request: Request) -> Result<Option<Response>, NetError> {
        let Some(active) = self.active().await else {
            return Ok(None);
        };

        let mut state = active.watch_state();
        let settled = state
            .wait_for(|s| matches!(s, WorkerState::Activated | WorkerState::Redundant))
            .await
            .map(|s| *s);
        if !matches!(settled, Ok(WorkerState::Activated)) {
            debug!(worker = %active.id(), url = %request.url, "Active worker retired, not intercepting");
            return Ok(None);
        }
        active.fetch(request).await
    }

    /// Deliver a push to the active worker.
    pub async fn push(&self, data: Option<Bytes>) -> Result<PushOutcome, ServiceWorkerError> {
        self.require_active().await?.push(data).await
    }

    /// Deliver a notification click to the active worker.
    pub async fn notification_click(
        &self,
        click: NotificationClick,
    ) -> Result<ClickOutcome, ServiceWorkerError> {
        self.require_active().await?.notification_click(click).await
    }

    async fn require_active(&self) -> Result<WorkerHandle, ServiceWorkerError> {
        self.active()
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("no active worker for {}", self.scope)))
    }

    /// Retire every worker. Returns `false` if there was none.
    pub async fn unregister(&self) -> bool {
        let _transition = self.transition.lock().await;
        let slots = std::mem::take(&mut *self.slots.write().await);
        let handles: Vec<_> = [slots.installing, slots.waiting, slots.active]
            .into_iter()
            .flatten()
            .collect();
        for handle in &handles {
            self.retire(handle);
        }
        info!(scope = %self.scope, workers = handles.len(), "Unregistered");
        !handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStorage;
    use crate::messenger::{ClientEvent, ClientMessage, ClientMessenger};
    use crate::network::StaticNetwork;
    use crate::push::TracingNotifier;

    fn context() -> (WorkerContext, Arc<StaticNetwork>) {
        let network = Arc::new(StaticNetwork::new());
        let (messenger, _) = ClientMessenger::new();
        let ctx = WorkerContext {
            caches: Arc::new(CacheStorage::new()),
            network: network.clone(),
            notifier: Arc::new(TracingNotifier::new()),
            messenger: Arc::new(messenger),
        };
        (ctx, network)
    }

    fn deployment(n: u32) -> WorkerConfig {
        WorkerConfig {
            deployment: n,
            ..WorkerConfig::default()
        }
    }

    fn scope() -> Url {
        Url::parse("https://pantry.test/").unwrap()
    }

    #[tokio::test]
    async fn test_first_install_activates() {
        let (ctx, _) = context();
        let registration = Registration::new(scope(), None);
        let mut events = registration.subscribe();

        let worker = ServiceWorker::new(deployment(1), ctx).unwrap();
        let handle = registration.install(worker).await.unwrap();

        assert_eq!(handle.state(), WorkerState::Activated);
        assert!(registration.waiting().await.is_none());
        assert_eq!(registration.active().await.unwrap().id(), handle.id());

        let id = handle.id();
        assert_eq!(events.try_recv().unwrap(), RegistrationEvent::UpdateFound { worker: id });
        assert_eq!(
            events.try_recv().unwrap(),
            RegistrationEvent::StateChange { worker: id, state: WorkerState::Installed }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RegistrationEvent::StateChange { worker: id, state: WorkerState::Activated }
        );
    }

    #[tokio::test]
    async fn test_second_install_waits_until_skip_waiting() {
        let (ctx, _) = context();
        let registration = Registration::new(scope(), None);
        let v1 = registration
            .install(ServiceWorker::new(deployment(1), ctx.clone()).unwrap())
            .await
            .unwrap();
        let v2 = registration
            .install(ServiceWorker::new(deployment(2), ctx.clone()).unwrap())
            .await
            .unwrap();

        assert_eq!(v2.state(), WorkerState::Installed);
        assert_eq!(registration.waiting().await.unwrap().id(), v2.id());
        assert_eq!(registration.active().await.unwrap().id(), v1.id());

        assert!(!registration.skip_waiting(v1.id()).await.unwrap());
        assert!(registration.skip_waiting(v2.id()).await.unwrap());
        assert_eq!(v1.state(), WorkerState::Redundant);
        assert_eq!(v2.state(), WorkerState::Activated);
        assert_eq!(ctx.caches.list_versions().await, vec![CacheVersion::new("pantry-v2")]);
    }

    #[tokio::test]
    async fn test_skip_waiting_message_activates() {
        let (ctx, _) = context();
        let registration = Registration::new(scope(), None);
        let mut page = ctx.messenger.connect(scope()).await;
        let v1 = registration
            .install(ServiceWorker::new(deployment(1), ctx.clone()).unwrap())
            .await
            .unwrap();
        let v2 = registration
            .install(ServiceWorker::new(deployment(2), ctx.clone()).unwrap())
            .await
            .unwrap();

        registration
            .waiting()
            .await
            .unwrap()
            .post_message(&ClientMessage::SkipWaiting)
            .unwrap();

        loop {
            match page.recv().await {
                Some(ClientEvent::ControllerChange { current, previous }) if current == v2.id() => {
                    assert_eq!(previous, Some(v1.id()));
                    break;
                }
                Some(_) => continue,
                None => panic!("page disconnected"),
            }
        }
        let mut state = v2.watch_state();
        state.wait_for(|s| *s == WorkerState::Activated).await.unwrap();
        assert!(registration.waiting().await.is_none());
    }

    #[tokio::test]
    async fn test_newer_waiting_replaces_older() {
        let (ctx, _) = context();
        let registration = Registration::new(scope(), None);
        registration
            .install(ServiceWorker::new(deployment(1), ctx.clone()).unwrap())
            .await
            .unwrap();
        let v2 = registration
            .install(ServiceWorker::new(deployment(2), ctx.clone()).unwrap())
            .await
            .unwrap();
        let v3 = registration
            .install(ServiceWorker::new(deployment(3), ctx.clone()).unwrap())
            .await
            .unwrap();

        assert_eq!(v2.state(), WorkerState::Redundant);
        assert_eq!(registration.waiting().await.unwrap().id(), v3.id());
    }

    #[tokio::test]
    async fn test_update_installs_published_deployment() {
        let (ctx, _) = context();
        let checker = Arc::new(DeploymentChecker::new(ctx.clone()));
        let registration = Registration::new(scope(), Some(checker.clone() as Arc<dyn UpdateChecker>));

        assert!(registration.update().await.unwrap().is_none());

        checker.publish(deployment(3)).await;
        let v3 = registration.update().await.unwrap().unwrap();
        assert_eq!(v3.state(), WorkerState::Activated);

        // Same deployment again: nothing to do.
        assert!(registration.update().await.unwrap().is_none());

        checker.publish(deployment(4)).await;
        let v4 = registration.update().await.unwrap().unwrap();
        assert_eq!(registration.waiting().await.unwrap().id(), v4.id());
    }

    #[tokio::test]
    async fn test_fetch_without_controller_is_not_intercepted() {
        let registration = Registration::new(scope(), None);
        let request = Request::get(scope().join("/static/js/main.js").unwrap());
        assert!(registration.fetch(request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_routes_through_active() {
        let (ctx, network) = context();
        let asset = scope().join("/static/js/app.js").unwrap();
        network.serve(&asset, Response::ok("app")).await;
        let registration = Registration::new(scope(), None);
        registration
            .install(ServiceWorker::new(deployment(1), ctx).unwrap())
            .await
            .unwrap();

        let response = registration.fetch(Request::get(asset)).await.unwrap().unwrap();
        assert_eq!(&response.body[..], b"app");
    }

    #[tokio::test]
    async fn test_push_requires_active() {
        let registration = Registration::new(scope(), None);
        assert!(matches!(
            registration.push(None).await,
            Err(ServiceWorkerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister_retires_everything() {
        let (ctx, _) = context();
        let registration = Registration::new(scope(), None);
        let v1 = registration
            .install(ServiceWorker::new(deployment(1), ctx.clone()).unwrap())
            .await
            .unwrap();

        assert!(registration.unregister().await);
        assert_eq!(v1.state(), WorkerState::Redundant);
        assert!(registration.active().await.is_none());
        assert!(!registration.unregister().await);
    }
}
