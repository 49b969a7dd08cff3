//! # Pantry Page
//!
//! The page side of the worker's update flow: a status the UI can render
//! (`current`, `checking`, `available`, `updating`), an explicit update check,
//! the `SKIP_WAITING` handshake and a single reload once the new worker is in
//! control.

use thiserror::Error;

pub mod bridge;

pub use bridge::{PageHost, UpdateBridge, UpdateStatus};

/// Errors raised by the update bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("No worker is waiting to be activated")]
    NoWaitingWorker,

    #[error("Worker error: {0}")]
    Worker(#[from] pantry_sw::ServiceWorkerError),
}
