//! # Pantry Common
//!
//! Logging setup and small helpers shared by the offline worker
//! (`pantry-sw`) and the page-side bridge (`pantry-page`).

pub mod logging;
pub mod time;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use time::now_millis;
