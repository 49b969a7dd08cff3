//! Worker configuration.
//!
//! One [`WorkerConfig`] describes one deployment of the worker: which cache
//! bucket it owns, which shell assets it pre-seeds, how URLs are routed and
//! what a notification looks like when a push carries no fields. It is built
//! once at start-up and shared read-only by every component.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::cache::CacheVersion;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Immutable configuration injected into a worker at start-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Application name, the prefix of every cache bucket.
    pub app_name: String,

    /// Deployment number; the bucket is `<app_name>-v<deployment>`.
    pub deployment: u32,

    /// Origin the worker is registered for.
    pub origin: String,

    /// Static shell pre-seeded at install. Never contains the root document.
    pub shell_manifest: Vec<String>,

    /// URL shapes used by the request router.
    pub routes: RouteConfig,

    /// Defaults for push notifications.
    pub notifications: NotificationDefaults,
}

/// URL shapes that drive routing decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteConfig {
    /// Prefix of authentication endpoints (never cached).
    pub auth_prefix: String,

    /// The one non-GET request the worker forwards itself.
    pub auth_refresh_path: String,

    /// Prefix of all other API endpoints (never cached).
    pub api_prefix: String,

    /// Path prefixes of static assets.
    pub static_prefixes: Vec<String>,

    /// File extensions of static assets, without the dot.
    pub static_extensions: Vec<String>,
}

/// What a notification looks like when the push payload leaves fields out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,

    /// Deep link used by the `view` action and when no URL is supplied.
    pub inventory_route: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            app_name: "pantry".to_string(),
            deployment: 1,
            origin: "http://localhost:3000".to_string(),
            shell_manifest: vec![
                "/static/css/main.css".to_string(),
                "/static/js/main.js".to_string(),
                "/manifest.json".to_string(),
                "/static/icons/icon-192x192.png".to_string(),
                "/static/icons/icon-512x512.png".to_string(),
            ],
            routes: RouteConfig::default(),
            notifications: NotificationDefaults::default(),
        }
    }
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            auth_prefix: "/api/auth/".to_string(),
            auth_refresh_path: "/api/auth/refresh".to_string(),
            api_prefix: "/api/".to_string(),
            static_prefixes: vec!["/static/".to_string()],
            static_extensions: ["css", "js", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "Pantry".to_string(),
            body: "You have a new reminder".to_string(),
            icon: "/static/icons/icon-192x192.png".to_string(),
            badge: "/static/icons/badge-72x72.png".to_string(),
            tag: "pantry-reminder".to_string(),
            inventory_route: "/inventory".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Parse and validate a JSON document. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Check the invariants the rest of the worker relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::Invalid("appName must not be empty".to_string()));
        }
        self.origin_url()?;
        if let Some(root) = self.shell_manifest.iter().find(|p| p.as_str() == "/") {
            return Err(ConfigError::Invalid(format!(
                "shell manifest must not pre-seed the root document ({root})"
            )));
        }
        if !self.routes.auth_prefix.starts_with(&self.routes.api_prefix) {
            return Err(ConfigError::Invalid(
                "authPrefix must live under apiPrefix".to_string(),
            ));
        }
        Ok(())
    }

    /// The bucket tag owned by this deployment.
    pub fn cache_version(&self) -> CacheVersion {
        CacheVersion::for_deployment(&self.app_name, self.deployment)
    }

    /// The registered origin as a URL.
    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.origin)
            .map_err(|e| ConfigError::Invalid(format!("origin {:?}: {e}", self.origin)))
    }

    /// Resolve a path (or absolute URL) against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, ConfigError> {
        self.origin_url()?
            .join(path)
            .map_err(|e| ConfigError::Invalid(format!("{path:?}: {e}")))
    }

    /// Same config, next deployment.
    pub fn next_deployment(&self) -> Self {
        Self {
            deployment: self.deployment + 1,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_version().as_str(), "pantry-v1");
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config =
            WorkerConfig::from_json_str(r#"{"appName":"larder","deployment":4}"#).unwrap();
        assert_eq!(config.cache_version().as_str(), "larder-v4");
        assert_eq!(config.routes.api_prefix, "/api/");
        assert_eq!(config.notifications.inventory_route, "/inventory");
    }

    #[test]
    fn test_root_document_rejected_from_shell() {
        let result = WorkerConfig::from_json_str(r#"{"shellManifest":["/","/static/js/main.js"]}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_origin_rejected() {
        let result = WorkerConfig::from_json_str(r#"{"origin":"not a url"}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            WorkerConfig::from_json_str("{"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_resolve_against_origin() {
        let config = WorkerConfig::default();
        let url = config.resolve("/static/js/main.js").unwrap();
        assert_eq!(url.as_str(), "http://localhost:3000/static/js/main.js");
    }

    #[test]
    fn test_next_deployment() {
        let config = WorkerConfig::default().next_deployment();
        assert_eq!(config.cache_version().as_str(), "pantry-v2");
    }

    #[test]
    fn test_from_path() {
        let path = std::env::temp_dir().join(format!("pantry-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"deployment":7}"#).unwrap();
        let config = WorkerConfig::from_path(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.deployment, 7);
    }
}
