//! # Camley Net
//!
//! Request/response model and network access for the Camley offline cache.
//!
//! ## Design Goals
//!
//! 1. **Buffered responses**: bodies are `Bytes`, so duplicating a response
//!    for the cache is a cheap clone
//! 2. **Response typing**: every network response is tagged basic, CORS or
//!    opaque relative to the requesting origin
//! 3. **Request classification**: [`RequestInterceptor`] decides which requests
//!    may touch the cache at all
//! 4. **Fetcher seam**: the worker only sees [`Fetcher`], so tests can swap in
//!    a scripted network

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Position;

pub use url::Url;

pub mod intercept;

pub use intercept::{BypassReason, PatternType, RequestClass, RequestInterceptor, UrlPattern};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable: {0}")]
    Offline(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl NetError {
    /// Whether the failure means no response could be obtained at all.
    pub fn is_connectivity(&self) -> bool {
        match self {
            NetError::Offline(_) | NetError::Timeout(_) => true,
            NetError::HttpError(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as reported by the page that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    #[default]
    SameOrigin,
    NoCors,
    Cors,
}

/// What kind of resource the request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestDestination {
    #[default]
    Empty,
    Document,
    Style,
    Script,
    Image,
    Manifest,
}

impl RequestDestination {
    /// Guess a destination from the file extension of a URL path.
    pub fn from_path(path: &str) -> Self {
        if path.ends_with(".webmanifest") || path.ends_with("manifest.json") {
            return Self::Manifest;
        }
        let Some(guess) = mime_guess::from_path(path).first() else {
            return Self::Empty;
        };
        if guess.subtype() == mime::CSS {
            Self::Style
        } else if guess.subtype() == mime::JAVASCRIPT {
            Self::Script
        } else if guess.subtype() == mime::HTML {
            Self::Document
        } else if guess.type_() == mime::IMAGE {
            Self::Image
        } else {
            Self::Empty
        }
    }
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub destination: RequestDestination,
    pub timeout: Option<Duration>,
}

impl Request {
    fn with_method(url: Url, method: Method) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            destination: RequestDestination::default(),
            timeout: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::with_method(url, Method::GET)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        let mut request = Self::with_method(url, Method::POST);
        request.body = Some(body);
        request
    }

    /// Create a top-level page load.
    pub fn navigate(url: Url) -> Self {
        let mut request = Self::with_method(url, Method::GET);
        request.mode = RequestMode::Navigate;
        request.destination = RequestDestination::Document;
        request
    }

    /// Change the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the destination.
    pub fn destination(mut self, destination: RequestDestination) -> Self {
        self.destination = destination;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// The declared destination, or one guessed from the path.
    pub fn effective_destination(&self) -> RequestDestination {
        match self.destination {
            RequestDestination::Empty => RequestDestination::from_path(self.url.path()),
            declared => declared,
        }
    }
}

/// Response type relative to the requesting origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin network response.
    Basic,
    /// Cross-origin response readable through CORS.
    Cors,
    /// Cross-origin no-cors response.
    Opaque,
    /// Constructed locally (never touched the network).
    #[default]
    Default,
    /// Network error.
    Error,
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Option<Url>,
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response_type: ResponseType,
    pub redirected: bool,
}

impl Response {
    /// Build a locally generated response.
    pub fn synthetic(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        Self {
            url: None,
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: body.into(),
            response_type: ResponseType::Default,
            redirected: false,
        }
    }

    /// A response standing for "no response could be produced".
    pub fn network_error() -> Self {
        Self {
            url: None,
            status: StatusCode::OK,
            status_text: String::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            response_type: ResponseType::Error,
            redirected: false,
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.response_type != ResponseType::Error && self.status.is_success()
    }

    pub fn is_network_error(&self) -> bool {
        self.response_type == ResponseType::Error
    }

    /// Parsed Content-Type header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Anything that can turn a request into a network response.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout. `None` waits indefinitely.
    pub default_timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("CamleyOffline/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Some(Duration::from_secs(30)),
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// Resource loader backed by reqwest.
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled);
        if let Some(timeout) = config.default_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn classify(request: &Request, final_url: &Url) -> ResponseType {
        if final_url.origin() == request.url.origin() {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }
}

/// Whether two URLs name the same resource, ignoring fragments.
fn same_resource(a: &Url, b: &Url) -> bool {
    a[..Position::AfterQuery] == b[..Position::AfterQuery]
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_connect() {
                NetError::Offline(e.to_string())
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let redirected = !same_resource(&url, &request.url);
        let response_type = Self::classify(request, &url);

        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            response_type = ?response_type,
            redirected,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url: Some(url),
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            response_type,
            redirected,
        })
    }
}
