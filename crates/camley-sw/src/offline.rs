//! The offline cache worker: precache on install, evict old versions on
//! activate, serve cache-first with a network fallback and populate.

use crate::cache::CacheEntry;
use crate::clients::ClientMatchOptions;
use crate::message::{MessageEvent, MessageReply, WorkerMessage};
use crate::notification::{NotificationClickEvent, NotificationOptions, NotificationPayload, PushEvent};
use crate::policy::{self, FallbackAction, FallbackLadder};
use crate::worker::{FetchEvent, InstallOutcome, SyncEvent, WorkerScope, WorkerScript};
use crate::ServiceWorkerError;
use async_trait::async_trait;
use camley_common::OfflineConfig;
use camley_net::{Request, RequestClass, RequestInterceptor, Response};
use futures::future::{join_all, try_join_all};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Cache-first worker for the transport app.
#[derive(Debug, Clone)]
pub struct OfflineCacheWorker {
    config: Arc<OfflineConfig>,
    interceptor: RequestInterceptor,
    ladder: FallbackLadder,
}

impl OfflineCacheWorker {
    pub fn new(config: OfflineConfig) -> Self {
        let interceptor = RequestInterceptor::with_bypass_fragments(&config.bypass_prefixes);
        Self {
            config: Arc::new(config),
            interceptor,
            ladder: FallbackLadder::standard(),
        }
    }

    /// Replace the offline fallback rules.
    pub fn with_ladder(mut self, ladder: FallbackLadder) -> Self {
        self.ladder = ladder;
        self
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    pub fn interceptor(&self) -> &RequestInterceptor {
        &self.interceptor
    }

    /// Name of the store this version reads and writes.
    pub fn cache_name(&self) -> &str {
        &self.config.cache_version
    }

    /// Fetch every URL and store the responses in the current cache, all or
    /// nothing. Returns how many entries were stored.
    async fn add_all(&self, scope: &WorkerScope, urls: &[String]) -> Result<usize, ServiceWorkerError> {
        let requests = urls
            .iter()
            .map(|url| scope.resolve(url).map(Request::get))
            .collect::<Result<Vec<_>, _>>()?;

        let entries = try_join_all(requests.iter().map(|request| async move {
            let response = scope.fetcher.fetch(request).await?;
            if !response.ok() {
                return Err(ServiceWorkerError::NetworkError(format!(
                    "{} responded {}",
                    request.url, response.status
                )));
            }
            Ok::<_, ServiceWorkerError>(CacheEntry::capture(request, &response))
        }))
        .await?;

        let count = entries.len();
        scope.caches.put_all(self.cache_name(), entries).await?;
        Ok(count)
    }

    async fn cache_first(&self, scope: &WorkerScope, event: &FetchEvent) -> Response {
        let request = &event.request;

        match scope.caches.match_request(request).await {
            Ok(Some(entry)) => {
                debug!(path = request.url.path(), "Serving from cache");
                return entry.to_response();
            }
            Ok(None) => {}
            Err(e) => warn!(url = %request.url, error = %e, "Cache lookup failed, treating as miss"),
        }

        debug!(path = request.url.path(), "Fetching from network");
        let response = match scope.fetcher.fetch(request).await {
            Ok(response) if !response.is_network_error() => response,
            Ok(_) => {
                warn!(url = %request.url, "Network returned an error response");
                return self.fallback(scope, request).await;
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Network request failed");
                return self.fallback(scope, request).await;
            }
        };

        if policy::is_cacheable_response(&response) {
            let entry = CacheEntry::capture(request, &response);
            let caches = Arc::clone(&scope.caches);
            let name = self.config.cache_version.clone();
            event.lifetime.wait_until(async move {
                let url = entry.url.clone();
                match caches.put(&name, entry).await {
                    Ok(()) => debug!(url = %url, "Stored in cache"),
                    Err(e) => warn!(url = %url, error = %e, "Cache population failed"),
                }
            });
        }
        response
    }

    async fn fallback(&self, scope: &WorkerScope, request: &Request) -> Response {
        let action = self.ladder.select(request);
        debug!(url = %request.url, ?action, "Offline fallback");

        match action {
            FallbackAction::CachedPage => {
                let page = match scope.resolve(&self.config.offline_page) {
                    Ok(url) => Request::get(url),
                    Err(e) => {
                        warn!(error = %e, "Offline page is not a valid URL");
                        return Response::network_error();
                    }
                };
                match scope.caches.match_request(&page).await {
                    Ok(Some(entry)) => entry.to_response(),
                    Ok(None) => Response::network_error(),
                    Err(e) => {
                        warn!(error = %e, "Offline page lookup failed");
                        Response::network_error()
                    }
                }
            }
            FallbackAction::PlaceholderStylesheet => policy::placeholder_stylesheet(),
            FallbackAction::PlaceholderScript => policy::placeholder_script(),
            FallbackAction::Unavailable => policy::unavailable(&self.config.offline_message),
        }
    }
}

#[async_trait]
impl WorkerScript for OfflineCacheWorker {
    fn name(&self) -> &str {
        "offline-cache"
    }

    async fn on_install(&self, scope: &WorkerScope) -> Result<InstallOutcome, ServiceWorkerError> {
        info!(cache = self.cache_name(), urls = self.config.precache.len(), "Precaching");

        match self.add_all(scope, &self.config.precache).await {
            Ok(count) => {
                info!(cache = self.cache_name(), count, "Precache complete");
                Ok(InstallOutcome { skip_waiting: true })
            }
            Err(e) => {
                error!(cache = self.cache_name(), error = %e, "Precache failed");
                Err(ServiceWorkerError::InstallFailed(e.to_string()))
            }
        }
    }

    async fn on_activate(&self, scope: &WorkerScope) -> Result<(), ServiceWorkerError> {
        let names = match scope.caches.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Listing caches failed");
                Vec::new()
            }
        };

        let current = self.cache_name();
        let deletions = names
            .into_iter()
            .filter(|name| name != current)
            .map(|name| async move {
                let result = scope.caches.delete(&name).await;
                (name, result)
            });
        for (name, result) in join_all(deletions).await {
            match result {
                Ok(_) => info!(cache = %name, "Deleted stale cache"),
                Err(e) => warn!(cache = %name, error = %e, "Deleting stale cache failed"),
            }
        }

        let claimed = scope.clients.write().await.claim(scope.worker_id, &scope.scope);
        info!(cache = current, claimed, "Cache clean, controlling clients");
        Ok(())
    }

    async fn on_fetch(&self, scope: &WorkerScope, event: &FetchEvent) -> Option<Response> {
        match self.interceptor.classify(&event.request) {
            RequestClass::Bypass(reason) => {
                debug!(url = %event.request.url, ?reason, "Bypassing cache");
                None
            }
            RequestClass::Cacheable => Some(self.cache_first(scope, event).await),
        }
    }

    async fn on_push(&self, scope: &WorkerScope, event: &PushEvent) -> Result<(), ServiceWorkerError> {
        let defaults = &self.config.notification;
        let payload = NotificationPayload::decode(event.data.as_deref(), defaults);
        let options = NotificationOptions::for_payload(&payload, defaults);

        let shown = scope.notifications.write().await.show(&payload.title, options);
        info!(id = ?shown.id, title = %shown.title, "Push notification shown");
        Ok(())
    }

    async fn on_notification_click(
        &self,
        scope: &WorkerScope,
        event: &NotificationClickEvent,
    ) -> Result<(), ServiceWorkerError> {
        debug!(id = ?event.notification.id, action = ?event.action, "Notification clicked");
        scope.notifications.write().await.close(event.notification.id);

        let target = match event.notification.options.data.url.as_str() {
            "" => "/",
            url => url,
        };
        let target = scope.resolve(target)?;

        let mut clients = scope.clients.write().await;
        let existing = clients
            .match_all(scope.worker_id, ClientMatchOptions::all_windows())
            .into_iter()
            .find(|client| client.url == target)
            .map(|client| client.id.clone());

        match existing {
            Some(id) => {
                clients.focus(&id)?;
                info!(client = %id, url = %target, "Focused existing window");
            }
            None => {
                let opened = clients.open_window(target);
                info!(client = %opened.id, url = %opened.url, "Opened window");
            }
        }
        Ok(())
    }

    async fn on_message(&self, scope: &WorkerScope, event: MessageEvent) {
        debug!(data = %event.data, "Message received");

        let Some(WorkerMessage::CacheAssets { urls }) = WorkerMessage::parse(&event.data) else {
            debug!("Ignoring unrecognized message");
            return;
        };

        let success = match self.add_all(scope, &urls).await {
            Ok(count) => {
                info!(count, "Cached additional assets");
                true
            }
            Err(e) => {
                warn!(error = %e, "Caching additional assets failed");
                false
            }
        };

        if !event.reply(MessageReply { success }) {
            debug!("No reply port for CACHE_ASSETS");
        }
    }

    async fn on_sync(&self, _scope: &WorkerScope, event: &SyncEvent) -> Result<(), ServiceWorkerError> {
        if self.config.sync_tags.iter().any(|tag| tag == &event.tag) {
            info!(tag = %event.tag, "Background sync");
        } else {
            debug!(tag = %event.tag, "Ignoring sync tag");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryCacheStore, RequestKey};
    use crate::clients::{Client, Clients};
    use crate::notification::Notifications;
    use crate::clients::ClientId;
    use crate::registration::{RegistrationOptions, ServiceWorkerContainer, ServiceWorkerRegistration};
    use crate::worker::ServiceWorkerId;
    use camley_net::{Fetcher, NetError, RequestMode, ResponseType, Url};
    use http::{Method, StatusCode};
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    const ORIGIN: &str = "https://camley.example";

    fn basic(content_type: &str, body: &str) -> Response {
        let mut response = Response::synthetic(StatusCode::OK, content_type, body.to_string());
        response.response_type = ResponseType::Basic;
        response
    }

    /// Fetcher serving fixed responses by path and counting calls.
    #[derive(Default)]
    struct StubFetcher {
        routes: HashMap<String, Response>,
        failing: HashSet<String>,
        offline: AtomicBool,
        calls: AtomicUsize,
    }

    impl StubFetcher {
        fn site() -> Self {
            Self::default()
                .route("/", basic("text/html", "<h1>Camley</h1>"))
                .route("/login", basic("text/html", "<form></form>"))
                .route("/dashboard", basic("text/html", "<h1>Panel</h1>"))
                .route("/static/css/style.css", basic("text/css", "body{}"))
                .route("/static/js/admin.js", basic("application/javascript", "admin()"))
                .route("/static/js/app.js", basic("application/javascript", "app()"))
                .route("/manifest.json", basic("application/json", "{}"))
                .route("/static/img/bus.png", basic("image/png", "png"))
        }

        fn route(mut self, path: &str, response: Response) -> Self {
            self.routes.insert(path.to_string(), response);
            self
        }

        fn failing(mut self, path: &str) -> Self {
            self.failing.insert(path.to_string());
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let path = request.url.path();
            if self.offline.load(Ordering::SeqCst) || self.failing.contains(path) {
                return Err(NetError::Offline(request.url.to_string()));
            }
            let mut response = self
                .routes
                .get(path)
                .cloned()
                .unwrap_or_else(|| Response::synthetic(StatusCode::NOT_FOUND, "text/html", "missing"));
            if response.response_type == ResponseType::Default {
                response.response_type = ResponseType::Basic;
            }
            response.url = Some(request.url.clone());
            Ok(response)
        }
    }

    /// Memory store that counts access and can be told to fail.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryCacheStore,
        reads: AtomicUsize,
        writes: AtomicUsize,
        fail_puts: AtomicBool,
        fail_keys: AtomicBool,
    }

    impl CountingStore {
        fn touched(&self) -> usize {
            self.reads.load(Ordering::SeqCst) + self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CacheStore for CountingStore {
        async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.open(name).await
        }

        async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.has(name).await
        }

        async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_keys.load(Ordering::SeqCst) {
                return Err(ServiceWorkerError::CacheError("keys unavailable".to_string()));
            }
            self.inner.keys().await
        }

        async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(name).await
        }

        async fn match_request(&self, request: &Request) -> Result<Option<CacheEntry>, ServiceWorkerError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.match_request(request).await
        }

        async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(ServiceWorkerError::CacheError("quota exceeded".to_string()));
            }
            self.inner.put(name, entry).await
        }

        async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), ServiceWorkerError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.put_all(name, entries).await
        }

        async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, ServiceWorkerError> {
            self.inner.entries(name).await
        }
    }

    struct Harness {
        worker: OfflineCacheWorker,
        scope: WorkerScope,
        fetcher: Arc<StubFetcher>,
        store: Arc<CountingStore>,
    }

    impl Harness {
        fn new(config: OfflineConfig, fetcher: StubFetcher) -> Self {
            let fetcher = Arc::new(fetcher);
            let store = Arc::new(CountingStore::default());
            let scope_url = Url::parse(&format!("{}/", ORIGIN)).unwrap();
            let scope = WorkerScope {
                scope: scope_url.clone(),
                worker_id: ServiceWorkerId::next(),
                caches: store.clone(),
                clients: Arc::new(RwLock::new(Clients::default())),
                notifications: Arc::new(RwLock::new(Notifications::default())),
                fetcher: fetcher.clone(),
                registration: Arc::new(RwLock::new(ServiceWorkerRegistration::new(scope_url))),
            };
            Self {
                worker: OfflineCacheWorker::new(config),
                scope,
                fetcher,
                store,
            }
        }

        fn site() -> Self {
            Self::new(OfflineConfig::default(), StubFetcher::site())
        }

        fn url(&self, path: &str) -> Url {
            Url::parse(&format!("{}{}", ORIGIN, path)).unwrap()
        }

        async fn fetch(&self, request: Request) -> Option<Response> {
            let event = FetchEvent::new(request);
            let response = self.worker.on_fetch(&self.scope, &event).await;
            event.lifetime.settle().await;
            response
        }

        async fn current_entries(&self) -> Vec<CacheEntry> {
            self.store.entries(self.worker.cache_name()).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_bypassed_requests_never_touch_cache() {
        let h = Harness::site();
        let requests = vec![
            Request::get(h.url("/api/rutas")),
            Request::get(h.url("/admin/usuarios")),
            Request::get(h.url("/conductor/ruta/3")),
            Request::get(h.url("/padre/hijos")),
            Request::get(h.url("/v1/api/estado")),
            Request::post(h.url("/static/css/style.css"), "x".into()),
            Request::get(h.url("/login")).method(Method::DELETE),
        ];

        for request in requests {
            assert!(h.fetch(request).await.is_none());
        }
        assert_eq!(h.store.touched(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_makes_no_network_call() {
        let h = Harness::site();
        let request = Request::get(h.url("/static/css/style.css"));
        let cached = basic("text/css", "cached{}");
        h.store
            .put(h.worker.cache_name(), CacheEntry::capture(&request, &cached))
            .await
            .unwrap();

        let response = h.fetch(request).await.unwrap();
        assert_eq!(response.text().unwrap(), "cached{}");
        assert_eq!(h.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_miss_fetches_once_and_stores_one_entry() {
        let h = Harness::site();
        let request = Request::get(h.url("/static/js/app.js"));
        let key = RequestKey::from_request(&request);

        let response = h.fetch(request).await.unwrap();
        assert_eq!(response.text().unwrap(), "app()");
        assert_eq!(h.fetcher.calls(), 1);

        let entries = h.current_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key(), key);
    }

    #[tokio::test]
    async fn test_unqualified_responses_are_returned_not_stored() {
        let mut opaque = basic("image/png", "cdn");
        opaque.response_type = ResponseType::Opaque;
        let mut redirected = basic("text/html", "moved");
        redirected.redirected = true;
        let fetcher = StubFetcher::site()
            .route("/cdn/logo.png", opaque)
            .route("/old-home", redirected);
        let h = Harness::new(OfflineConfig::default(), fetcher);

        let missing = h.fetch(Request::get(h.url("/nowhere"))).await.unwrap();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        let opaque = h.fetch(Request::get(h.url("/cdn/logo.png"))).await.unwrap();
        assert_eq!(opaque.response_type, ResponseType::Opaque);
        h.fetch(Request::get(h.url("/old-home"))).await.unwrap();

        assert!(h.current_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_population_failure_does_not_fail_response() {
        let h = Harness::site();
        h.store.fail_puts.store(true, Ordering::SeqCst);

        let response = h.fetch(Request::get(h.url("/static/img/bus.png"))).await.unwrap();
        assert!(response.ok());
        assert!(h.current_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_population_waits_on_lifetime() {
        let h = Harness::site();
        let event = FetchEvent::new(Request::get(h.url("/login")));
        h.worker.on_fetch(&h.scope, &event).await.unwrap();

        assert_eq!(event.lifetime.settle().await, 1);
        assert_eq!(h.current_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_install_precaches_manifest() {
        let h = Harness::site();
        let outcome = h.worker.on_install(&h.scope).await.unwrap();

        assert!(outcome.skip_waiting);
        assert_eq!(h.current_entries().await.len(), 6);
    }

    #[tokio::test]
    async fn test_install_is_all_or_nothing() {
        let config = OfflineConfig {
            precache: vec!["/".into(), "/login".into(), "/static/css/style.css".into()],
            ..Default::default()
        };
        let h = Harness::new(config, StubFetcher::site().failing("/login"));

        let result = h.worker.on_install(&h.scope).await;
        assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
        assert!(h.store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_install_rejects_error_status() {
        let config = OfflineConfig {
            precache: vec!["/".into(), "/gone".into()],
            ..Default::default()
        };
        let h = Harness::new(config, StubFetcher::site());

        assert!(h.worker.on_install(&h.scope).await.is_err());
        assert!(h.current_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_activate_deletes_only_stale_caches() {
        let h = Harness::site();
        for name in ["camley-transporte-v2.0", "camley-transporte-v2.1", "runtime-images"] {
            h.store.open(name).await.unwrap();
        }
        let page = h.scope.clients.write().await.add(Client::window(h.url("/")));

        h.worker.on_activate(&h.scope).await.unwrap();

        assert_eq!(h.store.keys().await.unwrap(), vec!["camley-transporte-v2.1".to_string()]);
        let clients = h.scope.clients.read().await;
        assert_eq!(clients.get(&page).unwrap().controller, Some(h.scope.worker_id));
    }

    #[tokio::test]
    async fn test_activate_survives_store_failure() {
        let h = Harness::site();
        h.store.fail_keys.store(true, Ordering::SeqCst);
        let page = h.scope.clients.write().await.add(Client::window(h.url("/login")));

        h.worker.on_activate(&h.scope).await.unwrap();
        assert!(h.scope.clients.read().await.get(&page).unwrap().controller.is_some());
    }

    #[tokio::test]
    async fn test_offline_navigation_serves_cached_root() {
        let h = Harness::site();
        h.worker.on_install(&h.scope).await.unwrap();
        h.fetcher.offline.store(true, Ordering::SeqCst);

        let response = h.fetch(Request::navigate(h.url("/horarios"))).await.unwrap();
        assert_eq!(response.text().unwrap(), "<h1>Camley</h1>");
    }

    #[tokio::test]
    async fn test_offline_navigation_without_cached_root() {
        let h = Harness::site();
        h.fetcher.offline.store(true, Ordering::SeqCst);

        let response = h.fetch(Request::navigate(h.url("/horarios"))).await.unwrap();
        assert!(response.is_network_error());
    }

    #[tokio::test]
    async fn test_offline_placeholders_and_unavailable() {
        let h = Harness::site();
        h.fetcher.offline.store(true, Ordering::SeqCst);

        let css = h.fetch(Request::get(h.url("/static/css/theme.css"))).await.unwrap();
        assert_eq!(css.text().unwrap(), policy::PLACEHOLDER_CSS);
        assert_eq!(css.headers.get("content-type").unwrap(), "text/css");

        let js = h.fetch(Request::get(h.url("/static/js/mapa.js"))).await.unwrap();
        assert_eq!(js.text().unwrap(), policy::PLACEHOLDER_JS);

        let image = h.fetch(Request::get(h.url("/static/img/bus.png"))).await.unwrap();
        assert_eq!(image.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(image.status_text, "Service Unavailable");
        assert_eq!(image.text().unwrap(), "Página no disponible sin conexión");
    }

    #[tokio::test]
    async fn test_navigation_mode_beats_extension() {
        let h = Harness::site();
        h.fetcher.offline.store(true, Ordering::SeqCst);

        let request = Request::get(h.url("/static/css/theme.css")).mode(RequestMode::Navigate);
        assert!(h.fetch(request).await.unwrap().is_network_error());
    }

    #[tokio::test]
    async fn test_push_plain_text_becomes_body() {
        let h = Harness::site();
        h.worker.on_push(&h.scope, &PushEvent::text("not json")).await.unwrap();

        let notifications = h.scope.notifications.read().await;
        let shown = notifications.active();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].options.body, "not json");
        assert_eq!(shown[0].title, "Camley Transporte");
    }

    #[tokio::test]
    async fn test_push_json_payload() {
        let h = Harness::site();
        let event = PushEvent::text(r#"{"title":"Ruta 2","body":"Retraso de 10 minutos","url":"/dashboard"}"#);
        h.worker.on_push(&h.scope, &event).await.unwrap();

        let notifications = h.scope.notifications.read().await;
        let shown = notifications.active()[0];
        assert_eq!(shown.title, "Ruta 2");
        assert_eq!(shown.options.data.url, "/dashboard");
        assert_eq!(shown.options.vibrate, vec![100, 50, 100]);
    }

    async fn show(h: &Harness, url: &str) -> NotificationClickEvent {
        let payload = json!({ "title": "Camley", "body": "Llegada", "url": url }).to_string();
        h.worker.on_push(&h.scope, &PushEvent::text(payload)).await.unwrap();
        let notification = h.scope.notifications.read().await.active()[0].clone();
        NotificationClickEvent {
            notification,
            action: Some("open".to_string()),
        }
    }

    #[tokio::test]
    async fn test_click_focuses_existing_window() {
        let h = Harness::site();
        let (home, dashboard) = {
            let mut clients = h.scope.clients.write().await;
            (
                clients.add(Client::window(h.url("/"))),
                clients.add(Client::window(h.url("/dashboard"))),
            )
        };
        let click = show(&h, "/dashboard").await;

        h.worker.on_notification_click(&h.scope, &click).await.unwrap();

        let clients = h.scope.clients.read().await;
        assert_eq!(clients.len(), 2);
        assert!(clients.get(&dashboard).unwrap().focused);
        assert!(!clients.get(&home).unwrap().focused);
        assert!(h.scope.notifications.read().await.active().is_empty());
    }

    #[tokio::test]
    async fn test_click_opens_window_when_none_matches() {
        let h = Harness::site();
        h.scope.clients.write().await.add(Client::window(h.url("/dashboard?tab=2")));
        let click = show(&h, "/dashboard").await;

        h.worker.on_notification_click(&h.scope, &click).await.unwrap();

        let clients = h.scope.clients.read().await;
        assert_eq!(clients.len(), 2);
        let opened = clients
            .match_all(h.scope.worker_id, ClientMatchOptions::all_windows())
            .into_iter()
            .find(|c| c.focused)
            .unwrap();
        assert_eq!(opened.url, h.url("/dashboard"));
    }

    #[tokio::test]
    async fn test_cache_assets_message_replies_success() {
        let h = Harness::site();
        let data = json!({ "type": "CACHE_ASSETS", "urls": ["/static/img/bus.png", "/dashboard"] });
        let (event, rx) = MessageEvent::new(data).with_reply();

        h.worker.on_message(&h.scope, event).await;

        assert_eq!(rx.await.unwrap(), json!({ "success": true }));
        assert_eq!(h.current_entries().await.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_assets_failure_replies_false() {
        let h = Harness::site();
        let data = json!({ "type": "CACHE_ASSETS", "urls": ["/static/img/bus.png", "/nowhere"] });
        let (event, rx) = MessageEvent::new(data).with_reply();

        h.worker.on_message(&h.scope, event).await;

        assert_eq!(rx.await.unwrap(), json!({ "success": false }));
        assert!(h.current_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_message_is_ignored() {
        let h = Harness::site();
        let (event, rx) = MessageEvent::new(json!({ "type": "PING" })).with_reply();

        h.worker.on_message(&h.scope, event).await;

        assert!(rx.await.is_err());
        assert_eq!(h.fetcher.calls(), 0);
        assert_eq!(h.store.touched(), 0);
    }

    #[tokio::test]
    async fn test_sync_tags() {
        let h = Harness::site();
        for tag in ["sync-data", "something-else"] {
            let event = SyncEvent {
                tag: tag.to_string(),
                last_chance: false,
            };
            assert!(h.worker.on_sync(&h.scope, &event).await.is_ok());
        }
    }

    // ==================== Through the container ====================

    struct Deployed {
        container: ServiceWorkerContainer,
        fetcher: Arc<StubFetcher>,
        store: Arc<CountingStore>,
        page: ClientId,
    }

    /// The offline worker registered and active, with the home page open.
    async fn deployed(fetcher: StubFetcher) -> Deployed {
        let fetcher = Arc::new(fetcher);
        let store = Arc::new(CountingStore::default());
        let (container, _events) = ServiceWorkerContainer::new(store.clone(), fetcher.clone());
        container
            .register(
                &format!("{}/service-worker.js", ORIGIN),
                Arc::new(OfflineCacheWorker::new(OfflineConfig::default())),
                RegistrationOptions::default(),
            )
            .await
            .unwrap();
        let page = container
            .open_page(Url::parse(&format!("{}/", ORIGIN)).unwrap())
            .await;
        Deployed {
            container,
            fetcher,
            store,
            page,
        }
    }

    fn cdn_script() -> Request {
        Request::get(Url::parse("https://cdn.example/leaflet.js").unwrap())
    }

    #[tokio::test]
    async fn test_controlled_page_cross_origin_request_reaches_worker() {
        let site = deployed(StubFetcher::site()).await;
        site.fetcher.offline.store(true, Ordering::SeqCst);

        let response = site.container.fetch(cdn_script(), Some(site.page.clone())).await;
        assert_eq!(response.text().unwrap(), policy::PLACEHOLDER_JS);

        let response = site.container.fetch(cdn_script(), None).await;
        assert!(response.is_network_error());
    }

    #[tokio::test]
    async fn test_opaque_response_is_served_not_stored() {
        let mut opaque = Response::synthetic(StatusCode::OK, "application/javascript", "L={}");
        opaque.response_type = ResponseType::Opaque;
        let site = deployed(StubFetcher::site().route("/leaflet.js", opaque)).await;
        let current = OfflineConfig::default().cache_version;
        let before = site.store.inner.entries(&current).await.unwrap().len();
        let reads = site.store.reads.load(Ordering::SeqCst);

        let response = site.container.fetch(cdn_script(), Some(site.page.clone())).await;
        site.container.drain().await;

        assert_eq!(response.response_type, ResponseType::Opaque);
        assert!(site.store.reads.load(Ordering::SeqCst) > reads);
        let entries = site.store.inner.entries(&current).await.unwrap();
        assert_eq!(entries.len(), before);
        assert!(entries.iter().all(|e| !e.url.contains("leaflet")));
    }

    #[tokio::test]
    async fn test_uncontrolled_page_goes_to_network() {
        let site = deployed(StubFetcher::site()).await;
        let stranger = site
            .container
            .open_page(Url::parse("https://elsewhere.example/").unwrap())
            .await;
        let touched = site.store.touched();

        let response = site
            .container
            .fetch(Request::get(Url::parse(&format!("{}/login", ORIGIN)).unwrap()), Some(stranger))
            .await;

        assert!(response.ok());
        assert_eq!(site.store.touched(), touched);
    }

    #[tokio::test]
    async fn test_background_work_stays_bounded() {
        let site = deployed(StubFetcher::site()).await;
        let home = Url::parse(&format!("{}/", ORIGIN)).unwrap();

        for _ in 0..1000 {
            let response = site
                .container
                .fetch(Request::get(home.clone()), Some(site.page.clone()))
                .await;
            assert!(response.ok());
        }
        assert_eq!(site.container.background_pending(), 0);

        for i in 0..50 {
            let url = Url::parse(&format!("{}/static/img/bus.png?v={}", ORIGIN, i)).unwrap();
            site.container.fetch(Request::get(url), Some(site.page.clone())).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(site.container.background_pending(), 0);
    }
}
