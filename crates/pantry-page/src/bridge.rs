//! Update bridge.
//!
//! Watches the registration for a waiting worker, lets the UI apply it, and
//! reloads the page once the new worker takes control.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use pantry_sw::{
    ClientEvent, ClientMessage, ClientPort, Registration, RegistrationEvent, WorkerId, WorkerState,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::BridgeError;

/// What the update UI shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    /// Running the latest worker.
    Current,
    /// An update check is in flight.
    Checking,
    /// A new worker is waiting.
    Available,
    /// `SKIP_WAITING` sent, waiting for the controller to change.
    Updating,
}

/// The page the bridge is mounted in.
pub trait PageHost: Send + Sync {
    /// Reload the document.
    fn reload(&self);

    fn navigate(&self, _url: &Url) {}

    fn focus(&self) {}
}

pub struct UpdateBridge {
    registration: Arc<Registration>,
    host: Arc<dyn PageHost>,
    status: watch::Sender<UpdateStatus>,
    /// Raw id of the worker `SKIP_WAITING` was last sent to; 0 for none.
    applying: AtomicU64,
    /// Raw id of the controller the page last reloaded for; 0 for none.
    reloaded_for: AtomicU64,
}

impl UpdateBridge {
    /// Mount the bridge on a page.
    ///
    /// `port` is the page's connection to the worker; the bridge takes it
    /// over and hands back the protocol messages it receives.
    pub async fn mount(
        registration: Arc<Registration>,
        port: ClientPort,
        host: Arc<dyn PageHost>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientMessage>) {
        let initial = if registration.waiting().await.is_some() {
            UpdateStatus::Available
        } else {
            UpdateStatus::Current
        };
        let (status, _) = watch::channel(initial);
        let events = registration.subscribe();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();

        let bridge = Arc::new(Self {
            registration,
            host,
            status,
            applying: AtomicU64::new(0),
            reloaded_for: AtomicU64::new(0),
        });
        debug!(client = ?port.id(), status = ?initial, "Update bridge mounted");

        tokio::spawn(run(Arc::downgrade(&bridge), events, port, messages_tx));
        (bridge, messages_rx)
    }

    pub fn status(&self) -> UpdateStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdateStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, status: UpdateStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(?previous, ?status, "Update status changed");
        }
    }

    /// Ask the host for a newer worker and report whether one is waiting.
    pub async fn check_for_updates(&self) -> UpdateStatus {
        self.set_status(UpdateStatus::Checking);
        let status = match self.registration.update().await {
            Ok(_) if self.registration.waiting().await.is_some() => UpdateStatus::Available,
            Ok(_) => UpdateStatus::Current,
            Err(e) => {
                warn!(error = %e, "Update check failed");
                UpdateStatus::Current
            }
        };
        self.set_status(status);
        status
    }

    /// Tell the waiting worker to take over. The page reloads when the
    /// controller changes.
    pub async fn apply_update(&self) -> Result<(), BridgeError> {
        let Some(waiting) = self.registration.waiting().await else {
            self.set_status(UpdateStatus::Current);
            return Err(BridgeError::NoWaitingWorker);
        };
        self.set_status(UpdateStatus::Updating);
        self.applying.store(waiting.id().raw(), Ordering::SeqCst);
        info!(worker = %waiting.id(), "Applying update");
        if let Err(e) = waiting.post_message(&ClientMessage::SkipWaiting) {
            self.set_status(UpdateStatus::Available);
            return Err(e.into());
        }
        Ok(())
    }

    async fn on_installed(&self, worker: WorkerId) {
        let waiting = self.registration.waiting().await;
        let active = self.registration.active().await;
        let is_update = waiting.is_some_and(|w| w.id() == worker)
            && active.is_some_and(|a| a.id() != worker);
        if !is_update {
            return;
        }
        // While updating, only a worker other than the one being applied
        // means the handshake was overtaken.
        if self.status() == UpdateStatus::Updating
            && self.applying.load(Ordering::SeqCst) == worker.raw()
        {
            return;
        }
        info!(worker = %worker, "Update available");
        self.set_status(UpdateStatus::Available);
    }

    fn on_controller_change(&self, previous: Option<WorkerId>, current: WorkerId) {
        if previous.is_none() {
            debug!(worker = %current, "Page claimed for the first time");
            return;
        }
        // One reload per controller; a reload leaves the bridge mounted.
        if self.reloaded_for.swap(current.raw(), Ordering::SeqCst) == current.raw() {
            debug!(worker = %current, "Already reloaded for this controller");
        } else {
            info!(worker = %current, "Controller changed, reloading");
            self.host.reload();
        }
        self.applying.store(0, Ordering::SeqCst);
        self.set_status(UpdateStatus::Current);
    }

    /// Re-read the slots after missing registration events.
    async fn resync(&self) {
        if let Some(waiting) = self.registration.waiting().await {
            if waiting.state() == WorkerState::Installed {
                self.on_installed(waiting.id()).await;
            }
        }
    }
}

async fn run(
    bridge: Weak<UpdateBridge>,
    mut events: broadcast::Receiver<RegistrationEvent>,
    mut port: ClientPort,
    messages: mpsc::UnboundedSender<ClientMessage>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(bridge) = bridge.upgrade() else { break };
                match event {
                    Ok(RegistrationEvent::UpdateFound { worker }) => {
                        debug!(worker = %worker, "Update found");
                    }
                    Ok(RegistrationEvent::StateChange { worker, state: WorkerState::Installed }) => {
                        bridge.on_installed(worker).await;
                    }
                    Ok(RegistrationEvent::StateChange { .. }) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed registration events");
                        bridge.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            event = port.recv() => {
                let Some(event) = event else { break };
                let Some(bridge) = bridge.upgrade() else { break };
                match event {
                    ClientEvent::ControllerChange { previous, current } => {
                        bridge.on_controller_change(previous, current);
                    }
                    ClientEvent::Message(value) => {
                        if let Some(message) = ClientMessage::parse(&value) {
                            // The page may have stopped listening.
                            let _ = messages.send(message);
                        }
                    }
                    ClientEvent::Navigate(url) => bridge.host.navigate(&url),
                    ClientEvent::Focus => bridge.host.focus(),
                }
            }
        }
    }
    debug!("Update bridge stopped");
}
