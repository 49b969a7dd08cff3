//! # Pantry Service Worker
//!
//! The background worker of the Pantry web app: offline caching, the
//! deploy/update lifecycle and push notifications.
//!
//! ## Features
//!
//! - **Routing**: per-request choice between cache, network or both
//! - **Versioned caches**: one bucket per deployment, stale buckets evicted on activation
//! - **Update handshake**: `SKIP_WAITING` from a page activates the waiting worker
//! - **Client messaging**: typed broadcast to every open page
//! - **Push**: tolerant payload parsing, notification rendering, deep-link clicks
//!
//! ## Architecture
//!
//! ```text
//! Registration (host)
//!     ├── installing (WorkerHandle)
//!     ├── waiting (WorkerHandle)
//!     └── active (WorkerHandle) ──► ServiceWorker event loop
//!                                       ├── LifecycleController  install / activate
//!                                       ├── RequestRouter        fetch
//!                                       ├── PushNotificationService  push / notificationclick
//!                                       └── ClientMessenger      message fan-out
//!
//! CacheStorage
//!     └── Cache (<app>-v<N>)
//!             └── CacheKey → CachedEntry
//! ```

use thiserror::Error;

pub mod cache;
pub mod config;
pub mod lifecycle;
pub mod messenger;
pub mod network;
pub mod push;
pub mod registration;
pub mod request;
pub mod router;
pub mod worker;

pub use cache::{CacheError, CacheStorage, CacheVersion, CachedEntry};
pub use config::{ConfigError, WorkerConfig};
pub use lifecycle::{ActivationReport, InstallReport, LifecycleController, WorkerState};
pub use messenger::{ClientEvent, ClientId, ClientMessage, ClientMessenger, ClientPort};
pub use network::{HttpNetwork, NetError, Network, StaticNetwork};
pub use push::{
    ClickOutcome, NotificationClick, Notifier, PushNotificationService, PushOutcome, PushPayload,
    TracingNotifier,
};
pub use registration::{DeploymentChecker, Registration, RegistrationEvent, UpdateChecker};
pub use request::{Request, Response};
pub use router::{RequestRouter, RoutingDecision};
pub use worker::{ServiceWorker, WorkerContext, WorkerHandle, WorkerId};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}
