//! Registrations and the container that drives workers through their
//! lifecycle and routes events to them.

use crate::cache::CacheStore;
use crate::clients::{Client, ClientId, Clients};
use crate::event::{EventSender, ServiceWorkerEvent};
use crate::install_prompt::DeferredInstallPrompt;
use crate::lifetime::ExtendLifetime;
use crate::message::MessageEvent;
use crate::notification::{NotificationClickEvent, NotificationId, Notifications, PushEvent};
use crate::worker::{
    FetchEvent, LifecycleEvent, ServiceWorker, ServiceWorkerState, SyncEvent, WorkerScope,
    WorkerScript,
};
use crate::ServiceWorkerError;
use camley_net::{Fetcher, Request, Response};
use hashbrown::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

// ==================== Registration ====================

/// Options for service worker registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL, relative to the script URL.
    pub scope: Option<String>,
}

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    unregistered: bool,
}

/// Shared handle to a registration.
pub type RegistrationHandle = Arc<RwLock<ServiceWorkerRegistration>>;

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            unregistered: false,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    pub fn is_unregistered(&self) -> bool {
        self.unregistered
    }

    /// Whether `url` falls under this registration.
    pub fn covers(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Mark every worker redundant and drop them. Returns false if already
    /// unregistered.
    pub fn unregister(&mut self) -> bool {
        if self.unregistered {
            return false;
        }
        for slot in [&mut self.installing, &mut self.waiting, &mut self.active] {
            if let Some(mut worker) = slot.take() {
                worker.discard();
            }
        }
        self.unregistered = true;
        true
    }
}

// ==================== Container ====================

/// Service worker container: owns registrations and the shared resources
/// every worker sees.
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, RegistrationHandle>>>,

    caches: Arc<dyn CacheStore>,
    clients: Arc<RwLock<Clients>>,
    notifications: Arc<RwLock<Notifications>>,
    fetcher: Arc<dyn Fetcher>,

    /// Outstanding fetch-event work.
    background: ExtendLifetime,

    /// Captured install prompt; cleared when a registration goes away.
    install_prompt: Arc<RwLock<DeferredInstallPrompt>>,

    event_tx: EventSender,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        caches: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                caches,
                clients: Arc::new(RwLock::new(Clients::new(event_tx.clone()))),
                notifications: Arc::new(RwLock::new(Notifications::new(event_tx.clone()))),
                fetcher,
                background: ExtendLifetime::new(),
                install_prompt: Arc::new(RwLock::new(DeferredInstallPrompt::new())),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn caches(&self) -> &Arc<dyn CacheStore> {
        &self.caches
    }

    pub fn clients(&self) -> &Arc<RwLock<Clients>> {
        &self.clients
    }

    pub fn notifications(&self) -> &Arc<RwLock<Notifications>> {
        &self.notifications
    }

    pub fn install_prompt(&self) -> &Arc<RwLock<DeferredInstallPrompt>> {
        &self.install_prompt
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, scope: &str, worker: &ServiceWorker) {
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id: worker.id,
            new_state: worker.state,
        });
    }

    fn worker_scope(&self, handle: &RegistrationHandle, scope: Url, worker: &ServiceWorker) -> WorkerScope {
        WorkerScope {
            scope,
            worker_id: worker.id,
            caches: Arc::clone(&self.caches),
            clients: Arc::clone(&self.clients),
            notifications: Arc::clone(&self.notifications),
            fetcher: Arc::clone(&self.fetcher),
            registration: Arc::clone(handle),
        }
    }

    fn resolve_scope(script_url: &Url, options: &RegistrationOptions) -> Result<Url, ServiceWorkerError> {
        let script_dir = match script_url.path().rfind('/') {
            Some(idx) => script_url.path()[..=idx].to_string(),
            None => "/".to_string(),
        };

        let scope = match options.scope {
            Some(ref s) => script_url
                .join(s)
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
            None => {
                let mut scope = script_url.clone();
                scope.set_path(&script_dir);
                scope.set_query(None);
                scope.set_fragment(None);
                scope
            }
        };

        if scope.origin() != script_url.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "scope {} is not same-origin with {}",
                scope, script_url
            )));
        }
        if !scope.path().starts_with(&script_dir) {
            return Err(ServiceWorkerError::SecurityError(format!(
                "scope {} is outside script directory {}",
                scope.path(),
                script_dir
            )));
        }
        Ok(scope)
    }

    /// Register a worker script, install it, and activate it when nothing
    /// else is active or the script asks to skip waiting.
    pub async fn register(
        &self,
        script_url: &str,
        script: Arc<dyn WorkerScript>,
        options: RegistrationOptions,
    ) -> Result<RegistrationHandle, ServiceWorkerError> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        let scope = Self::resolve_scope(&script_url, &options)?;
        let scope_str = scope.to_string();

        let handle = {
            let mut registrations = self.registrations.write().await;
            Arc::clone(
                registrations
                    .entry(scope_str.clone())
                    .or_insert_with(|| Arc::new(RwLock::new(ServiceWorkerRegistration::new(scope.clone())))),
            )
        };

        let mut worker = ServiceWorker::new(script_url, script);
        worker.apply(LifecycleEvent::Install)?;
        {
            let mut registration = handle.write().await;
            if let Some(mut previous) = registration.installing.replace(worker.clone()) {
                previous.discard();
                self.emit_state(&scope_str, &previous);
            }
        }
        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope_str.clone(),
        });
        self.emit_state(&scope_str, &worker);
        info!(scope = %scope_str, script = worker.script.name(), "Service worker installing");

        let worker_scope = self.worker_scope(&handle, scope, &worker);
        let outcome = worker.script.on_install(&worker_scope).await;

        let activate_now = {
            let mut registration = handle.write().await;
            if registration.installing.as_ref().map(|w| w.id) == Some(worker.id) {
                registration.installing = None;
            }

            match outcome {
                Err(e) => {
                    error!(scope = %scope_str, error = %e, "Service worker install failed");
                    worker.apply(LifecycleEvent::InstallFailed)?;
                    worker.error = Some(e.to_string());
                    self.emit_state(&scope_str, &worker);
                    let empty = registration.active.is_none() && registration.waiting.is_none();
                    drop(registration);
                    if empty {
                        self.registrations.write().await.remove(&scope_str);
                    }
                    return Err(e);
                }
                Ok(outcome) => {
                    worker.apply(LifecycleEvent::InstallSucceeded)?;
                    if let Some(mut stale) = registration.waiting.replace(worker.clone()) {
                        stale.discard();
                        self.emit_state(&scope_str, &stale);
                    }
                    self.emit_state(&scope_str, &worker);
                    info!(scope = %scope_str, skip_waiting = outcome.skip_waiting, "Service worker installed");
                    outcome.skip_waiting || registration.active.is_none()
                }
            }
        };

        if activate_now {
            self.activate(&scope_str).await?;
        }

        Ok(handle)
    }

    /// Activate the waiting worker of a registration.
    pub async fn activate(&self, scope: &str) -> Result<(), ServiceWorkerError> {
        let handle = self
            .registrations
            .read()
            .await
            .get(scope)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;

        let (worker, scope_url) = {
            let mut registration = handle.write().await;
            let mut worker = registration
                .waiting
                .take()
                .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".to_string()))?;
            worker.apply(LifecycleEvent::Activate)?;

            if let Some(mut old) = registration.active.take() {
                old.discard();
                self.emit_state(scope, &old);
            }
            registration.active = Some(worker.clone());
            (worker, registration.scope.clone())
        };
        self.emit_state(scope, &worker);

        let worker_scope = self.worker_scope(&handle, scope_url, &worker);
        if let Err(e) = worker.script.on_activate(&worker_scope).await {
            warn!(scope = %scope, error = %e, "Activate handler failed");
        }

        let mut registration = handle.write().await;
        if registration.is_unregistered() {
            drop(registration);
            let mut gone = worker;
            gone.discard();
            self.emit_state(scope, &gone);
            self.forget(scope, &handle).await;
            return Ok(());
        }

        if let Some(active) = registration.active.as_mut().filter(|w| w.id == worker.id) {
            active.apply(LifecycleEvent::ActivateFinished)?;
            self.emit_state(scope, active);
            info!(scope = %scope, script = active.script.name(), "Service worker activated");
        }
        Ok(())
    }

    async fn forget(&self, scope: &str, handle: &RegistrationHandle) {
        let mut registrations = self.registrations.write().await;
        if registrations.get(scope).is_some_and(|h| Arc::ptr_eq(h, handle)) {
            registrations.remove(scope);
            self.install_prompt.write().await.clear();
            self.emit(ServiceWorkerEvent::Unregistered {
                registration_scope: scope.to_string(),
            });
            info!(scope = %scope, "Registration removed");
        }
    }

    /// Registration whose scope is the longest prefix of `url`.
    pub async fn get_registration(&self, url: &str) -> Option<RegistrationHandle> {
        let url = Url::parse(url).ok()?;
        let registrations = self.registrations.read().await;

        registrations
            .iter()
            .filter(|(scope, _)| url.as_str().starts_with(scope.as_str()))
            .max_by_key(|(scope, _)| scope.len())
            .map(|(_, handle)| Arc::clone(handle))
    }

    /// All registered scopes, sorted.
    pub async fn get_registrations(&self) -> Vec<String> {
        let mut scopes: Vec<_> = self.registrations.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Unregister a scope.
    pub async fn unregister(&self, scope: &str) -> Result<bool, ServiceWorkerError> {
        let Some(handle) = self.registrations.read().await.get(scope).cloned() else {
            return Ok(false);
        };
        handle.write().await.unregister();
        self.forget(scope, &handle).await;
        Ok(true)
    }

    /// Open a page. It is controlled right away if an active worker covers it.
    pub async fn open_page(&self, url: Url) -> ClientId {
        let mut client = Client::window(url);
        if let Some(handle) = self.get_registration(client.url.as_str()).await {
            client.controller = handle
                .read()
                .await
                .get_active()
                .filter(|w| w.state.can_handle_events())
                .map(|w| w.id);
        }
        self.clients.write().await.add(client)
    }

    /// Close a page.
    pub async fn close_page(&self, id: &ClientId) -> bool {
        self.clients.write().await.remove(id).is_some()
    }

    async fn active_for(&self, url: &str) -> Option<(ServiceWorker, WorkerScope)> {
        let handle = self.get_registration(url).await?;
        let registration = handle.read().await;
        let worker = registration
            .get_active()
            .filter(|w| w.state.can_handle_events())?
            .clone();
        let scope = self.worker_scope(&handle, registration.scope.clone(), &worker);
        Some((worker, scope))
    }

    async fn active_in(&self, scope: &str) -> Result<(ServiceWorker, WorkerScope), ServiceWorkerError> {
        let handle = self
            .registrations
            .read()
            .await
            .get(scope)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
        let registration = handle.read().await;
        let worker = registration
            .get_active()
            .filter(|w| w.state.can_handle_events())
            .ok_or_else(|| ServiceWorkerError::StateError(format!("no active worker for {}", scope)))?
            .clone();
        let worker_scope = self.worker_scope(&handle, registration.scope.clone(), &worker);
        Ok((worker, worker_scope))
    }

    async fn network(&self, request: &Request) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network request failed");
                Response::network_error()
            }
        }
    }

    /// Worker a request goes to. A subresource request from a page belongs to
    /// that page's controller, wherever the request points. Navigations and
    /// requests without a known page are matched by URL.
    async fn active_for_request(
        &self,
        request: &Request,
        client_id: Option<&ClientId>,
    ) -> Option<(ServiceWorker, WorkerScope)> {
        if !request.is_navigation() {
            let client = match client_id {
                Some(id) => self.clients.read().await.get(id).cloned(),
                None => None,
            };
            if let Some(client) = client {
                if client.controller.is_none() {
                    return None;
                }
                return self.active_for(client.url.as_str()).await;
            }
        }
        self.active_for(request.url.as_str()).await
    }

    /// Route a request from a page through the active worker, or straight to
    /// the network when no worker is in control.
    pub async fn fetch(&self, request: Request, client_id: Option<ClientId>) -> Response {
        let Some((worker, scope)) = self.active_for_request(&request, client_id.as_ref()).await else {
            return self.network(&request).await;
        };

        let event = FetchEvent {
            request,
            client_id,
            lifetime: ExtendLifetime::new(),
        };
        let response = worker.script.on_fetch(&scope, &event).await;

        if event.lifetime.pending() > 0 {
            let lifetime = event.lifetime.clone();
            self.background.wait_until(async move {
                lifetime.settle().await;
            });
        }

        match response {
            Some(response) => response,
            None => self.network(&event.request).await,
        }
    }

    /// Number of fetch events still doing background work.
    pub fn background_pending(&self) -> usize {
        self.background.pending()
    }

    /// Wait for all background work started by fetch events.
    pub async fn drain(&self) -> usize {
        self.background.settle().await
    }

    /// Deliver a push message.
    pub async fn push(&self, scope: &str, event: PushEvent) -> Result<(), ServiceWorkerError> {
        let (worker, worker_scope) = self.active_in(scope).await?;
        worker.script.on_push(&worker_scope, &event).await
    }

    /// Deliver a click on a displayed notification.
    pub async fn notification_click(
        &self,
        scope: &str,
        id: NotificationId,
        action: Option<String>,
    ) -> Result<(), ServiceWorkerError> {
        let (worker, worker_scope) = self.active_in(scope).await?;
        let notification = self
            .notifications
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("notification {:?}", id)))?;
        let event = NotificationClickEvent {
            notification,
            action,
        };
        worker.script.on_notification_click(&worker_scope, &event).await
    }

    /// Post a message from a page. The returned receiver gets the reply, if
    /// the worker sends one.
    pub async fn post_message(
        &self,
        scope: &str,
        data: serde_json::Value,
        source: Option<ClientId>,
    ) -> Result<oneshot::Receiver<serde_json::Value>, ServiceWorkerError> {
        let (worker, worker_scope) = self.active_in(scope).await?;
        let (mut event, rx) = MessageEvent::new(data).with_reply();
        event.source = source;
        worker.script.on_message(&worker_scope, event).await;
        Ok(rx)
    }

    /// Deliver a background sync.
    pub async fn sync(&self, scope: &str, tag: &str) -> Result<(), ServiceWorkerError> {
        let (worker, worker_scope) = self.active_in(scope).await?;
        let event = SyncEvent {
            tag: tag.to_string(),
            last_chance: false,
        };
        worker.script.on_sync(&worker_scope, &event).await
    }

    /// State of the active worker for a scope.
    pub async fn active_state(&self, scope: &str) -> Option<ServiceWorkerState> {
        let handle = self.registrations.read().await.get(scope).cloned()?;
        let state = handle.read().await.get_active().map(|w| w.state);
        state
    }
}
