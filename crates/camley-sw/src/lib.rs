//! # Camley Service Worker
//!
//! Offline cache controller for the Camley transport web app.
//!
//! ## Features
//!
//! - **Registration**: scope resolution, install → waiting → active
//! - **Lifecycle**: explicit state machine, skip-waiting, client claiming
//! - **Cache Storage**: versioned named stores, in memory or persisted to disk
//! - **Fetch Interception**: bypass rules, cache-first with network fallback
//!   and an offline fallback ladder
//! - **Kill Switch**: a worker whose only job is to wipe caches and
//!   unregister itself
//! - **Push**: payload decoding, notifications, click routing
//! - **Messaging**: `CACHE_ASSETS` commands from pages
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── ServiceWorkerRegistration (per scope)
//!     │       ├── installing ─┐
//!     │       ├── waiting     ├── ServiceWorker ── Arc<dyn WorkerScript>
//!     │       └── active ─────┘        (OfflineCacheWorker | KillSwitchWorker)
//!     │
//!     ├── Arc<dyn CacheStore>   (CacheStorage in memory / PersistentCacheStorage)
//!     ├── Clients               (controlled pages)
//!     ├── Notifications
//!     └── Arc<dyn Fetcher>      (network)
//! ```

use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod event;
pub mod install_prompt;
pub mod kill;
pub mod lifetime;
pub mod message;
pub mod notification;
pub mod offline;
pub mod persist;
pub mod policy;
pub mod registration;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, CacheStore, MemoryCacheStore, RequestKey};
pub use clients::{Client, ClientId, ClientMatchOptions, ClientType, Clients};
pub use event::{EventSender, ServiceWorkerEvent};
pub use install_prompt::{DeferredInstallPrompt, InstallPromptEvent, PromptOutcome, UserChoice};
pub use kill::KillSwitchWorker;
pub use lifetime::ExtendLifetime;
pub use message::{MessageEvent, MessagePort, MessageReply, WorkerMessage};
pub use notification::{
    Notification, NotificationClickEvent, NotificationId, NotificationOptions, NotificationPayload,
    Notifications, PushEvent,
};
pub use offline::OfflineCacheWorker;
pub use persist::PersistentCacheStorage;
pub use policy::{FallbackAction, FallbackLadder, FallbackRule};
pub use registration::{RegistrationHandle, RegistrationOptions, ServiceWorkerContainer, ServiceWorkerRegistration};
pub use worker::{
    FetchEvent, InstallOutcome, LifecycleEvent, ServiceWorker, ServiceWorkerId, ServiceWorkerState,
    SyncEvent, WorkerScope, WorkerScript,
};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<camley_net::NetError> for ServiceWorkerError {
    fn from(err: camley_net::NetError) -> Self {
        Self::NetworkError(err.to_string())
    }
}

impl From<camley_common::CamleyError> for ServiceWorkerError {
    fn from(err: camley_common::CamleyError) -> Self {
        Self::CacheError(err.to_string())
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
