//! Response policy: what may be cached, and what to serve when the network
//! is unreachable.

use camley_net::{Request, RequestDestination, Response, ResponseType};
use http::StatusCode;

pub const PLACEHOLDER_CSS: &str = "/* Fallback CSS */";
pub const PLACEHOLDER_JS: &str = "// Fallback JS";

/// Whether a network response may be stored: a plain 200 from our own
/// origin that was not reached through a redirect.
pub fn is_cacheable_response(response: &Response) -> bool {
    response.status == StatusCode::OK
        && response.response_type == ResponseType::Basic
        && !response.redirected
}

/// What to serve for a request that failed offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAction {
    /// The cached offline page.
    CachedPage,
    /// An empty stylesheet.
    PlaceholderStylesheet,
    /// An empty script.
    PlaceholderScript,
    /// 503 with a readable message.
    Unavailable,
}

/// One rung of the ladder.
#[derive(Debug, Clone)]
pub struct FallbackRule {
    pub name: &'static str,
    pub applies: fn(&Request) -> bool,
    pub action: FallbackAction,
}

/// Ordered rules; the first that applies wins, otherwise `Unavailable`.
#[derive(Debug, Clone)]
pub struct FallbackLadder {
    rules: Vec<FallbackRule>,
}

impl FallbackLadder {
    /// Page loads, then stylesheets, then scripts.
    pub fn standard() -> Self {
        Self {
            rules: vec![
                FallbackRule {
                    name: "navigation",
                    applies: Request::is_navigation,
                    action: FallbackAction::CachedPage,
                },
                FallbackRule {
                    name: "stylesheet",
                    applies: |r| r.effective_destination() == RequestDestination::Style,
                    action: FallbackAction::PlaceholderStylesheet,
                },
                FallbackRule {
                    name: "script",
                    applies: |r| r.effective_destination() == RequestDestination::Script,
                    action: FallbackAction::PlaceholderScript,
                },
            ],
        }
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule after the existing ones.
    pub fn push(&mut self, rule: FallbackRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[FallbackRule] {
        &self.rules
    }

    pub fn select(&self, request: &Request) -> FallbackAction {
        self.rules
            .iter()
            .find(|rule| (rule.applies)(request))
            .map(|rule| rule.action)
            .unwrap_or(FallbackAction::Unavailable)
    }
}

impl Default for FallbackLadder {
    fn default() -> Self {
        Self::standard()
    }
}

pub fn placeholder_stylesheet() -> Response {
    Response::synthetic(StatusCode::OK, "text/css", PLACEHOLDER_CSS)
}

pub fn placeholder_script() -> Response {
    Response::synthetic(StatusCode::OK, "application/javascript", PLACEHOLDER_JS)
}

pub fn unavailable(message: &str) -> Response {
    Response::synthetic(
        StatusCode::SERVICE_UNAVAILABLE,
        "text/html",
        message.to_string(),
    )
}
