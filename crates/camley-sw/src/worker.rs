//! Workers, their lifecycle state machine, and the script interface each
//! worker variant implements.

use crate::cache::CacheStore;
use crate::clients::{ClientId, Clients};
use crate::lifetime::ExtendLifetime;
use crate::message::MessageEvent;
use crate::notification::{NotificationClickEvent, Notifications, PushEvent};
use crate::registration::RegistrationHandle;
use crate::ServiceWorkerError;
use async_trait::async_trait;
use camley_net::{Fetcher, Request, Response};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

// ==================== Identity ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

// ==================== State machine ====================

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Script loaded, nothing run yet.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed, waiting to activate.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and receiving functional events.
    Activated,
    /// Replaced, failed, or unregistered. Terminal.
    Redundant,
}

/// Inputs to the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Install,
    InstallSucceeded,
    InstallFailed,
    Activate,
    ActivateFinished,
    /// Replaced by a newer worker or its registration went away.
    Discard,
}

impl ServiceWorkerState {
    /// Next state for `event`, or a state error if the pair is not allowed.
    pub fn transition(self, event: LifecycleEvent) -> Result<Self, ServiceWorkerError> {
        use LifecycleEvent as E;
        use ServiceWorkerState as S;

        match (self, event) {
            (S::Parsed, E::Install) => Ok(S::Installing),
            (S::Installing, E::InstallSucceeded) => Ok(S::Installed),
            (S::Installing, E::InstallFailed) => Ok(S::Redundant),
            (S::Installed, E::Activate) => Ok(S::Activating),
            (S::Activating, E::ActivateFinished) => Ok(S::Activated),
            (_, E::Discard) => Ok(S::Redundant),
            (state, event) => Err(ServiceWorkerError::StateError(format!(
                "{:?} is not valid in state {:?}",
                event, state
            ))),
        }
    }

    /// Whether functional events (fetch, push, message) are delivered.
    pub fn can_handle_events(&self) -> bool {
        matches!(self, ServiceWorkerState::Activated)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceWorkerState::Redundant)
    }
}

impl std::fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

// ==================== Events ====================

/// A request intercepted from a controlled page.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,
    pub client_id: Option<ClientId>,
    /// Work the handler started and the host must wait for.
    pub lifetime: ExtendLifetime,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
            lifetime: ExtendLifetime::new(),
        }
    }
}

/// Background sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub tag: String,
    pub last_chance: bool,
}

/// Result of a successful install handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstallOutcome {
    /// Activate immediately instead of waiting for old pages to close.
    pub skip_waiting: bool,
}

// ==================== Scope ====================

/// Everything a worker script can reach. Replaces ambient globals: each
/// field is set up by the container before install and dropped with it.
#[derive(Clone)]
pub struct WorkerScope {
    pub scope: Url,
    pub worker_id: ServiceWorkerId,
    pub caches: Arc<dyn CacheStore>,
    pub clients: Arc<RwLock<Clients>>,
    pub notifications: Arc<RwLock<Notifications>>,
    pub fetcher: Arc<dyn Fetcher>,
    pub registration: RegistrationHandle,
}

impl WorkerScope {
    /// Resolve a path or URL against the registration scope.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.scope
            .join(path)
            .map_err(|e| ServiceWorkerError::NotFound(format!("{}: {}", path, e)))
    }

    /// Unregister this worker's registration. Returns false if it was
    /// already gone.
    pub async fn unregister(&self) -> bool {
        self.registration.write().await.unregister()
    }
}

impl std::fmt::Debug for WorkerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerScope")
            .field("scope", &self.scope.as_str())
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

// ==================== Script ====================

/// Event handlers of one worker variant.
///
/// The container awaits each returned future before it treats the event as
/// handled. Functional events are only delivered in the `Activated` state.
#[async_trait]
pub trait WorkerScript: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn on_install(&self, scope: &WorkerScope) -> Result<InstallOutcome, ServiceWorkerError>;

    async fn on_activate(&self, scope: &WorkerScope) -> Result<(), ServiceWorkerError>;

    /// `None` lets the request go to the network untouched.
    async fn on_fetch(&self, _scope: &WorkerScope, _event: &FetchEvent) -> Option<Response> {
        None
    }

    async fn on_push(&self, _scope: &WorkerScope, _event: &PushEvent) -> Result<(), ServiceWorkerError> {
        Ok(())
    }

    async fn on_notification_click(
        &self,
        _scope: &WorkerScope,
        _event: &NotificationClickEvent,
    ) -> Result<(), ServiceWorkerError> {
        Ok(())
    }

    async fn on_message(&self, _scope: &WorkerScope, _event: MessageEvent) {}

    async fn on_sync(&self, _scope: &WorkerScope, _event: &SyncEvent) -> Result<(), ServiceWorkerError> {
        Ok(())
    }
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Handlers.
    pub script: Arc<dyn WorkerScript>,

    /// Error message if install failed.
    pub error: Option<String>,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script_url: Url, script: Arc<dyn WorkerScript>) -> Self {
        Self {
            id: ServiceWorkerId::next(),
            script_url,
            state: ServiceWorkerState::Parsed,
            script,
            error: None,
        }
    }

    /// Apply a lifecycle event.
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<ServiceWorkerState, ServiceWorkerError> {
        let next = self.state.transition(event)?;
        self.state = next;
        Ok(next)
    }

    /// Mark redundant; always allowed.
    pub fn discard(&mut self) {
        self.state = ServiceWorkerState::Redundant;
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("script_url", &self.script_url.as_str())
            .field("script", &self.script.name())
            .field("state", &self.state)
            .field("error", &self.error)
            .finish()
    }
}
