//! Worker and network adapters for running against a saved snapshot.

use async_trait::async_trait;
use camley_net::{Fetcher, NetError, Request, Response};
use camley_sw::{
    FetchEvent, InstallOutcome, MessageEvent, NotificationClickEvent, OfflineCacheWorker, PushEvent,
    ServiceWorkerError, SyncEvent, WorkerScope, WorkerScript,
};
use tracing::debug;

/// A network that is never reachable.
pub struct Unreachable;

#[async_trait]
impl Fetcher for Unreachable {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        Err(NetError::Offline(request.url.to_string()))
    }
}

/// Offline worker that skips precaching when its store already exists, so a
/// snapshot warmed earlier can be driven without the origin.
pub struct ResumedWorker {
    inner: OfflineCacheWorker,
}

impl ResumedWorker {
    pub fn new(inner: OfflineCacheWorker) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl WorkerScript for ResumedWorker {
    fn name(&self) -> &str {
        "offline-cache-resumed"
    }

    async fn on_install(&self, scope: &WorkerScope) -> Result<InstallOutcome, ServiceWorkerError> {
        if let Ok(true) = scope.caches.has(self.inner.cache_name()).await {
            debug!(cache = self.inner.cache_name(), "Store already warm, skipping precache");
            return Ok(InstallOutcome { skip_waiting: true });
        }
        self.inner.on_install(scope).await
    }

    async fn on_activate(&self, scope: &WorkerScope) -> Result<(), ServiceWorkerError> {
        self.inner.on_activate(scope).await
    }

    async fn on_fetch(&self, scope: &WorkerScope, event: &FetchEvent) -> Option<Response> {
        self.inner.on_fetch(scope, event).await
    }

    async fn on_push(&self, scope: &WorkerScope, event: &PushEvent) -> Result<(), ServiceWorkerError> {
        self.inner.on_push(scope, event).await
    }

    async fn on_notification_click(
        &self,
        scope: &WorkerScope,
        event: &NotificationClickEvent,
    ) -> Result<(), ServiceWorkerError> {
        self.inner.on_notification_click(scope, event).await
    }

    async fn on_message(&self, scope: &WorkerScope, event: MessageEvent) {
        self.inner.on_message(scope, event).await
    }

    async fn on_sync(&self, scope: &WorkerScope, event: &SyncEvent) -> Result<(), ServiceWorkerError> {
        self.inner.on_sync(scope, event).await
    }
}
