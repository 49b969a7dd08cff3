//! Worker ⇄ page messaging.
//!
//! ```text
//! ServiceWorker ── broadcast ──┬──► ClientPort (tab 1)
//!                              ├──► ClientPort (tab 2)
//!                              └──► ClientPort (tab n)
//!
//! ClientPort ── Registration::{waiting,active}().post_message ──► ServiceWorker
//! ```
//!
//! Messages travel as JSON, the way `postMessage` would carry them, and are
//! parsed into [`ClientMessage`] at each receiving end. Shapes that do not
//! parse are ignored.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};
use url::{Origin, Url};

use crate::worker::WorkerId;
use crate::ServiceWorkerError;

/// The message protocol between worker and pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Page → waiting worker: become active now.
    SkipWaiting,
    /// Worker → pages: activation finished.
    SwActivated { timestamp: u64 },
    /// Page → worker: render a diagnostic notification.
    ShowTestNotification {
        #[serde(default)]
        data: TestNotification,
    },
    /// Worker → pages: a notification was rendered.
    NotificationShown { data: NotificationReport },
    /// Worker → pages: a notification failed to render.
    NotificationError { error: String },
}

/// Payload of `SHOW_TEST_NOTIFICATION`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestNotification {
    pub title: Option<String>,
    pub body: Option<String>,
    pub timestamp: Option<u64>,
}

/// Payload of `NOTIFICATION_SHOWN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationReport {
    pub title: String,
    pub timestamp: u64,
}

impl ClientMessage {
    /// Parse a posted value; `None` for anything outside the protocol.
    pub fn parse(value: &JsonValue) -> Option<Self> {
        match serde_json::from_value(value.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                trace!(error = %e, "Ignoring unknown message shape");
                None
            }
        }
    }

    pub fn to_value(&self) -> JsonValue {
        // Serializing a plain enum of strings and integers cannot fail.
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Unique identifier for a page client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// What a page receives.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A posted message, still in wire form.
    Message(JsonValue),
    /// The worker controlling this page changed (`controllerchange`).
    ControllerChange {
        previous: Option<WorkerId>,
        current: WorkerId,
    },
    /// The worker asked this page to load another URL.
    Navigate(Url),
    /// The worker focused this page.
    Focus,
}

/// Page-side end of a client connection.
#[derive(Debug)]
pub struct ClientPort {
    id: ClientId,
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ClientPort {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Wait for the next event; `None` once the messenger dropped the client.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain every pending message that parses as [`ClientMessage`].
    pub fn drain_messages(&mut self) -> Vec<ClientMessage> {
        let mut messages = Vec::new();
        while let Some(event) = self.try_recv() {
            if let ClientEvent::Message(value) = event {
                messages.extend(ClientMessage::parse(&value));
            }
        }
        messages
    }
}

/// Snapshot of a connected client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub url: Url,
    pub focused: bool,
    pub controller: Option<WorkerId>,
}

#[derive(Debug)]
struct ClientHandle {
    info: ClientInfo,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientHandle {
    fn send(&self, event: ClientEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Registry of open pages and the fan-out bus to them.
#[derive(Debug)]
pub struct ClientMessenger {
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    /// Ports of windows opened by the worker, handed to the host.
    windows_tx: mpsc::UnboundedSender<ClientPort>,
}

impl ClientMessenger {
    /// Create a messenger and the receiver of windows it opens.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientPort>) {
        let (windows_tx, windows_rx) = mpsc::unbounded_channel();
        (
            Self {
                clients: RwLock::new(HashMap::new()),
                windows_tx,
            },
            windows_rx,
        )
    }

    /// Register an open page.
    pub async fn connect(&self, url: Url) -> ClientPort {
        self.insert(url, false, None).await
    }

    async fn insert(&self, url: Url, focused: bool, controller: Option<WorkerId>) -> ClientPort {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId::new();
        debug!(client = ?id, url = %url, "Client connected");
        let info = ClientInfo {
            id,
            url,
            focused,
            controller,
        };
        self.clients.write().await.insert(id, ClientHandle { info, tx });
        ClientPort { id, rx }
    }

    /// Forget a page.
    pub async fn disconnect(&self, id: ClientId) -> bool {
        self.clients.write().await.remove(&id).is_some()
    }

    /// Every known client, ordered by id.
    pub async fn clients(&self) -> Vec<ClientInfo> {
        let mut infos: Vec<_> = self
            .clients
            .read()
            .await
            .values()
            .map(|handle| handle.info.clone())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub async fn controller(&self, id: ClientId) -> Option<WorkerId> {
        self.clients.read().await.get(&id)?.info.controller
    }

    /// Post `message` to every client. Returns how many received it;
    /// clients whose port is gone are pruned.
    pub async fn broadcast(&self, message: &ClientMessage) -> usize {
        let value = message.to_value();
        let mut clients = self.clients.write().await;
        let before = clients.len();
        clients.retain(|_, handle| handle.send(ClientEvent::Message(value.clone())));
        let delivered = clients.len();
        if delivered < before {
            debug!(pruned = before - delivered, "Pruned closed clients");
        }
        trace!(?message, delivered, "Broadcast message");
        delivered
    }

    /// Post `message` to one client.
    pub async fn post(&self, id: ClientId, message: &ClientMessage) -> Result<(), ServiceWorkerError> {
        self.send(id, ClientEvent::Message(message.to_value())).await
    }

    async fn send(&self, id: ClientId, event: ClientEvent) -> Result<(), ServiceWorkerError> {
        let mut clients = self.clients.write().await;
        let handle = clients
            .get(&id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id:?}")))?;
        if !handle.send(event) {
            clients.remove(&id);
            return Err(ServiceWorkerError::StateError(format!("client {id:?} is closed")));
        }
        Ok(())
    }

    /// Make `worker` the controller of every client. Each client whose
    /// controller actually changed gets a `ControllerChange`. Returns that count.
    pub async fn claim(&self, worker: WorkerId) -> usize {
        let mut clients = self.clients.write().await;
        let mut switched = 0;
        clients.retain(|_, handle| {
            if handle.info.controller == Some(worker) {
                return true;
            }
            let previous = handle.info.controller.replace(worker);
            let delivered = handle.send(ClientEvent::ControllerChange {
                previous,
                current: worker,
            });
            if delivered {
                switched += 1;
            }
            delivered
        });
        debug!(?worker, switched, "Claimed clients");
        switched
    }

    /// First window client of `origin`, preferring a focused one.
    pub async fn find_window(&self, origin: &Origin) -> Option<ClientId> {
        self.clients()
            .await
            .into_iter()
            .filter(|info| &info.url.origin() == origin)
            .min_by_key(|info| (!info.focused, info.id))
            .map(|info| info.id)
    }

    /// Focus a client and navigate it to `url`.
    pub async fn focus_and_navigate(&self, id: ClientId, url: Url) -> Result<(), ServiceWorkerError> {
        {
            let mut clients = self.clients.write().await;
            if !clients.contains_key(&id) {
                return Err(ServiceWorkerError::NotFound(format!("client {id:?}")));
            }
            for (other, handle) in clients.iter_mut() {
                handle.info.focused = *other == id;
            }
            if let Some(handle) = clients.get_mut(&id) {
                handle.info.url = url.clone();
            }
        }
        self.send(id, ClientEvent::Focus).await?;
        self.send(id, ClientEvent::Navigate(url)).await
    }

    /// Open a new focused window at `url`; its port goes to the host.
    pub async fn open_window(
        &self,
        url: Url,
        controller: Option<WorkerId>,
    ) -> Result<ClientId, ServiceWorkerError> {
        for handle in self.clients.write().await.values_mut() {
            handle.info.focused = false;
        }
        let port = self.insert(url, true, controller).await;
        let id = port.id();
        self.windows_tx.send(port).map_err(|_| {
            ServiceWorkerError::StateError("window host is gone".to_string())
        })?;
        Ok(id)
    }
}
