//! Events the service worker reports to its host.

use crate::clients::ClientId;
use crate::notification::NotificationId;
use crate::worker::{ServiceWorkerId, ServiceWorkerState};
use tokio::sync::mpsc;

/// Service worker events.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker started installing.
    UpdateFound { registration_scope: String },
    /// A page is now controlled by a different worker.
    ControllerChange {
        client_id: ClientId,
        worker_id: ServiceWorkerId,
    },
    /// Message posted to a page.
    ClientMessage {
        client_id: ClientId,
        data: serde_json::Value,
    },
    /// A page was focused.
    ClientFocused { client_id: ClientId },
    /// A new page was opened.
    WindowOpened { client_id: ClientId, url: String },
    /// An OS notification was displayed.
    NotificationShown { id: NotificationId, title: String },
    /// An OS notification was dismissed.
    NotificationClosed { id: NotificationId },
    /// The registration for a scope is gone.
    Unregistered { registration_scope: String },
}

/// Sending half of the host event channel.
pub type EventSender = mpsc::UnboundedSender<ServiceWorkerEvent>;

/// A sender whose receiver is already gone; events are dropped.
pub(crate) fn detached_sender() -> EventSender {
    mpsc::unbounded_channel().0
}
