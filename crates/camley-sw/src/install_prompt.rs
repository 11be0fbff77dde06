//! Deferred "add to home screen" prompt.
//!
//! The host captures the installable event instead of letting it show
//! immediately, offers an install button, and replays the prompt when the
//! user asks for it. A captured prompt can be used once.

use crate::now_millis;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Result of showing the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptOutcome {
    Accepted,
    Dismissed,
}

/// What the user picked, and on which platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChoice {
    pub outcome: PromptOutcome,
    #[serde(default)]
    pub platform: String,
}

impl UserChoice {
    pub fn accepted() -> Self {
        Self {
            outcome: PromptOutcome::Accepted,
            platform: String::new(),
        }
    }

    pub fn dismissed() -> Self {
        Self {
            outcome: PromptOutcome::Dismissed,
            platform: String::new(),
        }
    }
}

/// The installable signal raised by the host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstallPromptEvent {
    pub platforms: Vec<String>,
    pub captured_at: u64,
}

impl InstallPromptEvent {
    pub fn new(platforms: Vec<String>) -> Self {
        Self {
            platforms,
            captured_at: now_millis(),
        }
    }
}

/// Holder for a captured prompt.
#[derive(Debug, Default)]
pub struct DeferredInstallPrompt {
    pending: Option<InstallPromptEvent>,
    installed: bool,
}

impl DeferredInstallPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the event for later. A newer event replaces an older one.
    /// Returns whether an install button should be offered.
    pub fn capture(&mut self, event: InstallPromptEvent) -> bool {
        if self.installed {
            debug!("App already installed, ignoring install prompt");
            return false;
        }
        self.pending = Some(event);
        true
    }

    pub fn is_available(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Show the captured prompt and record the user's answer. The prompt is
    /// consumed either way; without one this does nothing and returns `None`.
    pub fn prompt(&mut self, choice: UserChoice) -> Option<UserChoice> {
        let event = self.pending.take()?;
        match choice.outcome {
            PromptOutcome::Accepted => {
                info!(platforms = ?event.platforms, "App installed");
                self.installed = true;
            }
            PromptOutcome::Dismissed => debug!("Install prompt dismissed"),
        }
        Some(choice)
    }

    /// Drop any captured prompt.
    pub fn clear(&mut self) {
        self.pending = None;
    }
}
