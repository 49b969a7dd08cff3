//! Install and activate.
//!
//! ```text
//! Parsed ─► Installing ─► Installed ─► Activating ─► Activated
//!               │                                        │
//!               └──────────────► Redundant ◄─────────────┘
//! ```
//!
//! Install pre-seeds the shell of the worker's own bucket. Activate evicts
//! every other bucket, claims the open pages and tells them about it. The
//! state is published through a watch channel so the host can hold back
//! fetches until activation has fully resolved.

use std::sync::Arc;

use futures::future::join_all;
use pantry_common::now_millis;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, CacheVersion};
use crate::config::WorkerConfig;
use crate::messenger::{ClientMessage, ClientMessenger};
use crate::network::Network;
use crate::request::Request;
use crate::worker::WorkerId;
use crate::ServiceWorkerError;

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Created, no lifecycle event yet.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, failed or unregistered.
    Redundant,
}

/// What install managed to pre-seed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub cached: usize,
    /// Shell URLs that could not be cached.
    pub failed: Vec<String>,
}

/// What activation cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    pub evicted: Vec<CacheVersion>,
    pub claimed: usize,
}

/// Drives one worker through install and activate.
pub struct LifecycleController {
    worker: WorkerId,
    version: CacheVersion,
    shell: Vec<Url>,
    caches: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    messenger: Arc<ClientMessenger>,
    state: Arc<watch::Sender<WorkerState>>,
}

impl LifecycleController {
    pub fn new(
        worker: WorkerId,
        config: &WorkerConfig,
        caches: Arc<CacheStorage>,
        network: Arc<dyn Network>,
        messenger: Arc<ClientMessenger>,
    ) -> Result<Self, ServiceWorkerError> {
        let shell = config
            .shell_manifest
            .iter()
            .map(|path| config.resolve(path))
            .collect::<Result<Vec<_>, _>>()?;
        let (state, _) = watch::channel(WorkerState::Parsed);

        Ok(Self {
            worker,
            version: config.cache_version(),
            shell,
            caches,
            network,
            messenger,
            state: Arc::new(state),
        })
    }

    pub fn version(&self) -> &CacheVersion {
        &self.version
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Shared handle to the state channel, for the host.
    pub fn state_channel(&self) -> Arc<watch::Sender<WorkerState>> {
        self.state.clone()
    }

    fn transition(&self, from: &[WorkerState], to: WorkerState) -> Result<(), ServiceWorkerError> {
        let current = self.state();
        if !from.contains(&current) {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot move from {current:?} to {to:?}"
            )));
        }
        debug!(worker = ?self.worker, ?current, next = ?to, "Lifecycle transition");
        self.state.send_replace(to);
        Ok(())
    }

    /// Open this deployment's bucket and pre-seed the shell.
    ///
    /// Assets that fail to download or are not cacheable are logged and
    /// skipped; install still succeeds with a partial shell.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        self.transition(&[WorkerState::Parsed], WorkerState::Installing)?;
        self.caches.open(&self.version).await;

        let fetches = self.shell.iter().map(|url| async move {
            let request = Request::get(url.clone());
            (url.clone(), self.network.fetch(&request).await)
        });

        let mut report = InstallReport::default();
        let mut fetched = Vec::new();
        for (url, result) in join_all(fetches).await {
            match result {
                Ok(response) => fetched.push((url, response)),
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to fetch shell asset");
                    report.failed.push(url.to_string());
                }
            }
        }

        let attempted = fetched.len();
        let rejected = self.caches.put_all(&self.version, fetched).await?;
        for (url, e) in &rejected {
            warn!(url = %url, error = %e, "Shell asset not cached");
            report.failed.push(url.to_string());
        }
        report.cached = attempted - rejected.len();

        self.transition(&[WorkerState::Installing], WorkerState::Installed)?;
        info!(
            version = %self.version,
            cached = report.cached,
            failed = report.failed.len(),
            "Worker installed"
        );
        Ok(report)
    }

    /// Evict stale buckets, claim clients and announce activation.
    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        self.transition(&[WorkerState::Installed], WorkerState::Activating)?;

        let mut report = ActivationReport::default();
        for version in self.caches.list_versions().await {
            if version != self.version && self.caches.delete(&version).await {
                debug!(version = %version, "Evicted stale cache bucket");
                report.evicted.push(version);
            }
        }

        report.claimed = self.messenger.claim(self.worker).await;

        self.messenger
            .broadcast(&ClientMessage::SwActivated {
                timestamp: now_millis(),
            })
            .await;

        self.transition(&[WorkerState::Activating], WorkerState::Activated)?;
        info!(
            version = %self.version,
            evicted = report.evicted.len(),
            claimed = report.claimed,
            "Worker activated"
        );
        Ok(report)
    }

    /// Retire the worker.
    pub fn mark_redundant(&self) {
        self.state.send_replace(WorkerState::Redundant);
    }
}
