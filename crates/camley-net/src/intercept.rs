//! Request classification: which requests may be served from or stored in
//! the cache, and which go straight to the network.

use crate::{Request, Url};
use http::Method;
use tracing::trace;

/// URL path pattern for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
}

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Exact path match.
    Exact,
    /// Path prefix match.
    Prefix,
    /// Path suffix match (e.g., extension).
    Suffix,
    /// Path contains substring.
    Contains,
}

impl UrlPattern {
    /// Create an exact match pattern.
    pub fn exact(path: &str) -> Self {
        Self {
            pattern_type: PatternType::Exact,
            pattern: path.to_string(),
        }
    }

    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self {
            pattern_type: PatternType::Prefix,
            pattern: prefix.to_string(),
        }
    }

    /// Create a suffix match pattern.
    pub fn suffix(suffix: &str) -> Self {
        Self {
            pattern_type: PatternType::Suffix,
            pattern: suffix.to_string(),
        }
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self {
            pattern_type: PatternType::Contains,
            pattern: substring.to_string(),
        }
    }

    /// Check if a URL's path matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        let path = url.path();
        match self.pattern_type {
            PatternType::Exact => path == self.pattern,
            PatternType::Prefix => path.starts_with(&self.pattern),
            PatternType::Suffix => path.ends_with(&self.pattern),
            PatternType::Contains => path.contains(&self.pattern),
        }
    }
}

/// Why a request skips the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassReason {
    /// Not a read.
    Method(Method),
    /// Path matched a bypass pattern.
    Path(String),
}

/// Outcome of classifying a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestClass {
    /// Forward to the network; never read or write the cache.
    Bypass(BypassReason),
    /// Eligible for cache-first handling.
    Cacheable,
}

impl RequestClass {
    pub fn is_cacheable(&self) -> bool {
        matches!(self, RequestClass::Cacheable)
    }
}

/// Static request classifier driven by method and path rules.
#[derive(Debug, Clone)]
pub struct RequestInterceptor {
    bypass: Vec<UrlPattern>,
    cacheable_methods: Vec<Method>,
}

impl RequestInterceptor {
    /// Create an interceptor that caches GET requests and bypasses nothing.
    pub fn new() -> Self {
        Self {
            bypass: Vec::new(),
            cacheable_methods: vec![Method::GET],
        }
    }

    /// Bypass every path containing one of the given fragments.
    pub fn with_bypass_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut interceptor = Self::new();
        for fragment in fragments {
            interceptor.bypass(UrlPattern::contains(fragment.as_ref()));
        }
        interceptor
    }

    /// Add a bypass pattern.
    pub fn bypass(&mut self, pattern: UrlPattern) {
        if !self.bypass.contains(&pattern) {
            self.bypass.push(pattern);
        }
    }

    /// Remove bypass patterns with the given pattern string.
    pub fn remove_bypass(&mut self, pattern: &str) {
        self.bypass.retain(|p| p.pattern != pattern);
    }

    pub fn bypass_patterns(&self) -> &[UrlPattern] {
        &self.bypass
    }

    /// Classify a request.
    pub fn classify(&self, request: &Request) -> RequestClass {
        if !self.cacheable_methods.contains(&request.method) {
            trace!(url = %request.url, method = %request.method, "Bypass: method");
            return RequestClass::Bypass(BypassReason::Method(request.method.clone()));
        }

        if let Some(pattern) = self.bypass.iter().find(|p| p.matches(&request.url)) {
            trace!(url = %request.url, pattern = %pattern.pattern, "Bypass: path");
            return RequestClass::Bypass(BypassReason::Path(pattern.pattern.clone()));
        }

        RequestClass::Cacheable
    }
}

impl Default for RequestInterceptor {
    fn default() -> Self {
        Self::new()
    }
}
