//! Notifications pushed to the media front end.
//!
//! The front end exposes `POST <url>/api/ripper-notification` accepting
//! `{"type": "info"|"success"|"error", "title": ..., "message": ...}`.
//! Delivery is best effort: an unreachable front end is logged and ignored.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const NOTIFICATION_PATH: &str = "/api/ripper-notification";

/// Severity shown by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Success,
    Error,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::Info => write!(f, "info"),
            NotificationKind::Success => write!(f, "success"),
            NotificationKind::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Info,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Success,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Error,
            title: title.into(),
            message: message.into(),
        }
    }
}

/// Receiver of lifecycle notifications. Implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Join the configured base URL with the notification endpoint.
pub fn endpoint_url(base: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), NOTIFICATION_PATH)
}

/// Posts notifications to the front end on a background task.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl HttpNotifier {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: base_url.filter(|u| !u.trim().is_empty()).map(endpoint_url),
        }
    }
}

impl NotificationSink for HttpNotifier {
    fn notify(&self, notification: Notification) {
        let Some(endpoint) = self.endpoint.clone() else {
            warn!(
                kind = %notification.kind,
                title = %notification.title,
                "notify url not configured; dropping notification"
            );
            return;
        };

        info!(kind = %notification.kind, title = %notification.title, url = %endpoint, "sending notification");
        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(&endpoint).json(&notification).send().await {
                Ok(res) if res.status().is_success() => {
                    info!(title = %notification.title, "notification delivered");
                }
                Ok(res) => {
                    warn!(status = %res.status(), title = %notification.title, "notification rejected");
                }
                Err(e) => {
                    warn!(error = %e, title = %notification.title, "failed to send notification");
                }
            }
        });
    }
}
