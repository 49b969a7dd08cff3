//! Push messages and system notifications.
//!
//! A push payload is validated once, at the boundary, into a
//! [`PushPayload`] and then resolved against [`NotificationDefaults`] into the
//! [`NotificationOptions`] that are actually rendered. Nothing about a push
//! can fail the worker: a payload that is not JSON becomes the notification
//! body, and a render failure is reported to the pages once.

use std::sync::Arc;

use async_trait::async_trait;
use pantry_common::now_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::NotificationDefaults;
use crate::messenger::{ClientId, ClientMessage, ClientMessenger, NotificationReport, TestNotification};
use crate::worker::WorkerId;
use crate::ServiceWorkerError;

/// Action ids understood by the click handler.
pub const ACTION_VIEW: &str = "view";
pub const ACTION_DISMISS: &str = "dismiss";

/// Errors raised by the notification surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("Notification permission not granted")]
    PermissionDenied,

    #[error("Failed to show notification: {0}")]
    Failed(String),
}

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

impl NotificationAction {
    pub fn new(action: &str, title: &str) -> Self {
        Self {
            action: action.to_string(),
            title: title.to_string(),
        }
    }
}

/// `data` member of a push payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationData {
    /// Deep link opened on click.
    pub url: Option<String>,
}

/// Inbound push payload; every field optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub tag: Option<String>,
    pub data: Option<NotificationData>,
    pub actions: Option<Vec<NotificationAction>>,
    pub require_interaction: Option<bool>,
}

impl PushPayload {
    /// Decode the bytes of a push event.
    ///
    /// No data, or only whitespace, yields the empty payload. Bytes that are
    /// not JSON are taken as plain text and become the body. Valid JSON is
    /// read field by field: a field of the wrong type is dropped, and so is
    /// an action without both `action` and `title`.
    pub fn parse(data: Option<&[u8]>) -> Self {
        let Some(bytes) = data else {
            return Self::default();
        };
        let text = String::from_utf8_lossy(bytes);
        if text.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => Self::from_value(&value),
            Err(e) => {
                debug!(error = %e, "Push payload is not JSON, using it as the body");
                Self {
                    body: Some(text.into_owned()),
                    ..Self::default()
                }
            }
        }
    }

    fn from_value(value: &Value) -> Self {
        let Some(fields) = value.as_object() else {
            debug!("Push payload is not an object, ignoring it");
            return Self::default();
        };
        let string = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_string);
        let data = fields.get("data").and_then(Value::as_object).map(|data| NotificationData {
            url: data.get("url").and_then(Value::as_str).map(str::to_string),
        });
        let actions = fields.get("actions").and_then(Value::as_array).map(|actions| {
            actions
                .iter()
                .filter_map(|action| serde_json::from_value(action.clone()).ok())
                .collect()
        });

        Self {
            title: string("title"),
            body: string("body"),
            icon: string("icon"),
            badge: string("badge"),
            tag: string("tag"),
            data,
            actions,
            require_interaction: fields.get("requireInteraction").and_then(Value::as_bool),
        }
    }

    /// Fill every absent field from `defaults`.
    pub fn resolve(self, defaults: &NotificationDefaults) -> NotificationOptions {
        NotificationOptions {
            title: self.title.unwrap_or_else(|| defaults.title.clone()),
            body: self.body.unwrap_or_else(|| defaults.body.clone()),
            icon: self.icon.unwrap_or_else(|| defaults.icon.clone()),
            badge: self.badge.unwrap_or_else(|| defaults.badge.clone()),
            tag: self.tag.unwrap_or_else(|| defaults.tag.clone()),
            data: self.data.unwrap_or_default(),
            actions: self.actions.unwrap_or_else(default_actions),
            require_interaction: self.require_interaction.unwrap_or(false),
        }
    }
}

fn default_actions() -> Vec<NotificationAction> {
    vec![
        NotificationAction::new(ACTION_VIEW, "View"),
        NotificationAction::new(ACTION_DISMISS, "Dismiss"),
    ]
}

/// A fully resolved notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOptions {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub data: NotificationData,
    pub actions: Vec<NotificationAction>,
    pub require_interaction: bool,
}

/// The system notification surface.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn show(&self, notification: &NotificationOptions) -> Result<(), NotificationError>;

    async fn close(&self, tag: &str);
}

/// Notifier that logs through `tracing` and remembers what is on screen.
#[derive(Debug)]
pub struct TracingNotifier {
    permitted: bool,
    visible: RwLock<Vec<NotificationOptions>>,
}

impl TracingNotifier {
    pub fn new() -> Self {
        Self::with_permission(true)
    }

    /// A notifier whose permission is granted or not.
    pub fn with_permission(permitted: bool) -> Self {
        Self {
            permitted,
            visible: RwLock::new(Vec::new()),
        }
    }

    /// Notifications currently shown, oldest first.
    pub async fn visible(&self) -> Vec<NotificationOptions> {
        self.visible.read().await.clone()
    }
}

impl Default for TracingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for TracingNotifier {
    async fn show(&self, notification: &NotificationOptions) -> Result<(), NotificationError> {
        if !self.permitted {
            return Err(NotificationError::PermissionDenied);
        }
        info!(
            title = %notification.title,
            body = %notification.body,
            tag = %notification.tag,
            "Showing notification"
        );
        let mut visible = self.visible.write().await;
        // Same tag replaces the notification on screen.
        visible.retain(|shown| shown.tag != notification.tag);
        visible.push(notification.clone());
        Ok(())
    }

    async fn close(&self, tag: &str) {
        self.visible.write().await.retain(|shown| shown.tag != tag);
    }
}

/// A click on a notification or one of its actions.
#[derive(Debug, Clone)]
pub struct NotificationClick {
    pub notification: NotificationOptions,
    /// The action button clicked, `None` for the notification body.
    pub action: Option<String>,
}

/// How a push was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Shown { title: String },
    Failed { error: String },
}

/// How a click was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    Dismissed,
    Focused { client: ClientId, url: Url },
    Opened { client: ClientId, url: Url },
}

/// Renders pushes and routes notification clicks.
pub struct PushNotificationService {
    worker: WorkerId,
    origin: Url,
    defaults: NotificationDefaults,
    notifier: Arc<dyn Notifier>,
    messenger: Arc<ClientMessenger>,
}

impl PushNotificationService {
    pub fn new(
        worker: WorkerId,
        origin: Url,
        defaults: NotificationDefaults,
        notifier: Arc<dyn Notifier>,
        messenger: Arc<ClientMessenger>,
    ) -> Self {
        Self {
            worker,
            origin,
            defaults,
            notifier,
            messenger,
        }
    }

    /// Handle a push event.
    pub async fn on_push(&self, data: Option<&[u8]>) -> PushOutcome {
        let options = PushPayload::parse(data).resolve(&self.defaults);
        self.show(options).await
    }

    /// Handle `SHOW_TEST_NOTIFICATION` from a page.
    pub async fn on_test_notification(&self, test: TestNotification) -> PushOutcome {
        let payload = PushPayload {
            title: test.title,
            body: test.body,
            ..PushPayload::default()
        };
        self.show(payload.resolve(&self.defaults)).await
    }

    /// Render and report the result to every open page. No retry.
    pub async fn show(&self, options: NotificationOptions) -> PushOutcome {
        match self.notifier.show(&options).await {
            Ok(()) => {
                let title = options.title;
                self.messenger
                    .broadcast(&ClientMessage::NotificationShown {
                        data: NotificationReport {
                            title: title.clone(),
                            timestamp: now_millis(),
                        },
                    })
                    .await;
                PushOutcome::Shown { title }
            }
            Err(e) => {
                warn!(error = %e, "Notification failed");
                let error = e.to_string();
                self.messenger
                    .broadcast(&ClientMessage::NotificationError {
                        error: error.clone(),
                    })
                    .await;
                PushOutcome::Failed { error }
            }
        }
    }

    /// Where a click should take the user; `None` for `dismiss`.
    pub fn resolve_target(&self, click: &NotificationClick) -> Option<Url> {
        let inventory = || self.join(&self.defaults.inventory_route);
        match click.action.as_deref() {
            Some(ACTION_DISMISS) => None,
            Some(ACTION_VIEW) => inventory(),
            _ => match click.notification.data.url.as_deref() {
                Some(link) => self.join(link).or_else(inventory),
                None => inventory(),
            },
        }
    }

    fn join(&self, link: &str) -> Option<Url> {
        match self.origin.join(link) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(link, error = %e, "Unusable notification link");
                None
            }
        }
    }

    /// Handle a click: close, then focus a matching page or open a window.
    pub async fn on_notification_click(
        &self,
        click: NotificationClick,
    ) -> Result<ClickOutcome, ServiceWorkerError> {
        self.notifier.close(&click.notification.tag).await;

        let Some(url) = self.resolve_target(&click) else {
            return Ok(ClickOutcome::Dismissed);
        };

        if let Some(client) = self.messenger.find_window(&self.origin.origin()).await {
            match self.messenger.focus_and_navigate(client, url.clone()).await {
                Ok(()) => return Ok(ClickOutcome::Focused { client, url }),
                Err(e) => debug!(error = %e, "Matched client went away, opening a window"),
            }
        }

        let client = self.messenger.open_window(url.clone(), Some(self.worker)).await?;
        Ok(ClickOutcome::Opened { client, url })
    }
}
