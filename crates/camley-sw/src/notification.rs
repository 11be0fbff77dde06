//! Push payloads and OS notifications.

use crate::event::{detached_sender, EventSender, ServiceWorkerEvent};
use crate::now_millis;
use camley_common::NotificationDefaults;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Notification identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// An inbound push message.
#[derive(Debug, Clone, Default)]
pub struct PushEvent {
    pub data: Option<Vec<u8>>,
}

impl PushEvent {
    pub fn empty() -> Self {
        Self { data: None }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Some(text.into().into_bytes()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawPayload {
    title: Option<String>,
    body: Option<String>,
    icon: Option<String>,
    badge: Option<String>,
    url: Option<String>,
}

/// A push payload with every field resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub url: String,
}

impl NotificationPayload {
    /// Decode push data. A JSON object overrides the defaults field by field;
    /// anything else becomes the body.
    pub fn decode(data: Option<&[u8]>, defaults: &NotificationDefaults) -> Self {
        let mut payload = Self {
            title: defaults.title.clone(),
            body: defaults.body.clone(),
            icon: defaults.icon.clone(),
            badge: defaults.badge.clone(),
            url: defaults.url.clone(),
        };

        let Some(data) = data else {
            return payload;
        };
        let text = String::from_utf8_lossy(data);

        let parsed = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .filter(|v| v.is_object())
            .and_then(|v| serde_json::from_value::<RawPayload>(v).ok());

        match parsed {
            Some(raw) => {
                if let Some(title) = raw.title {
                    payload.title = title;
                }
                if let Some(body) = raw.body {
                    payload.body = body;
                }
                if let Some(icon) = raw.icon.filter(|s| !s.is_empty()) {
                    payload.icon = icon;
                }
                if let Some(badge) = raw.badge.filter(|s| !s.is_empty()) {
                    payload.badge = badge;
                }
                if let Some(url) = raw.url.filter(|s| !s.is_empty()) {
                    payload.url = url;
                }
            }
            None => {
                debug!("Push payload is not a JSON object, using it as body");
                payload.body = text.into_owned();
            }
        }
        payload
    }
}

/// A notification action button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// Data attached to a notification, read back on click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    pub date_of_arrival: u64,
    pub primary_key: String,
    pub url: String,
}

/// Options passed when showing a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
    pub actions: Vec<NotificationAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl NotificationOptions {
    /// Options for a decoded payload.
    pub fn for_payload(payload: &NotificationPayload, defaults: &NotificationDefaults) -> Self {
        Self {
            body: payload.body.clone(),
            icon: payload.icon.clone(),
            badge: payload.badge.clone(),
            vibrate: defaults.vibrate.clone(),
            data: NotificationData {
                date_of_arrival: now_millis(),
                primary_key: "1".to_string(),
                url: payload.url.clone(),
            },
            actions: defaults
                .actions
                .iter()
                .map(|a| NotificationAction {
                    action: a.action.clone(),
                    title: a.title.clone(),
                })
                .collect(),
            tag: None,
        }
    }
}

/// A displayed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub options: NotificationOptions,
}

/// Click on a notification or one of its actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationClickEvent {
    pub notification: Notification,
    pub action: Option<String>,
}

/// Notifications currently on screen.
#[derive(Debug)]
pub struct Notifications {
    shown: HashMap<NotificationId, Notification>,
    events: EventSender,
}

impl Default for Notifications {
    fn default() -> Self {
        Self::new(detached_sender())
    }
}

impl Notifications {
    pub fn new(events: EventSender) -> Self {
        Self {
            shown: HashMap::new(),
            events,
        }
    }

    /// Display a notification.
    pub fn show(&mut self, title: &str, options: NotificationOptions) -> Notification {
        let notification = Notification {
            id: NotificationId::next(),
            title: title.to_string(),
            options,
        };
        self.shown.insert(notification.id, notification.clone());
        let _ = self.events.send(ServiceWorkerEvent::NotificationShown {
            id: notification.id,
            title: notification.title.clone(),
        });
        notification
    }

    /// Dismiss a notification.
    pub fn close(&mut self, id: NotificationId) -> Option<Notification> {
        let closed = self.shown.remove(&id);
        if closed.is_some() {
            let _ = self.events.send(ServiceWorkerEvent::NotificationClosed { id });
        }
        closed
    }

    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.shown.get(&id)
    }

    /// Notifications still on screen, oldest first.
    pub fn active(&self) -> Vec<&Notification> {
        let mut shown: Vec<_> = self.shown.values().collect();
        shown.sort_by_key(|n| n.id);
        shown
    }
}
