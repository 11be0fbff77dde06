//! Offline cache configuration

use crate::{CamleyError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the offline cache worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OfflineConfig {
    /// Name of the current cache store. Bumping the version embedded here
    /// invalidates every previously cached entry on the next activation.
    pub cache_version: String,

    /// Paths fetched and stored at install time, all or nothing
    pub precache: Vec<String>,

    /// Path fragments whose requests always go straight to the network
    pub bypass_prefixes: Vec<String>,

    /// Cached document served when a navigation fails offline
    pub offline_page: String,

    /// Body of the synthetic 503 response
    pub offline_message: String,

    /// Push notification defaults
    pub notification: NotificationDefaults,

    /// Background sync tags the worker acknowledges
    pub sync_tags: Vec<String>,

    /// Directory for the persistent cache snapshot
    pub cache_dir: PathBuf,
}

/// A notification action button
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationActionConfig {
    pub action: String,
    pub title: String,
}

/// Defaults applied to push payloads that omit fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,

    /// Page opened when the notification is clicked
    pub url: String,

    /// Vibration pattern in milliseconds
    pub vibrate: Vec<u32>,

    pub actions: Vec<NotificationActionConfig>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            cache_version: "camley-transporte-v2.1".to_string(),
            precache: [
                "/",
                "/login",
                "/static/css/style.css",
                "/static/js/admin.js",
                "/static/js/app.js",
                "/manifest.json",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            bypass_prefixes: ["/api/", "/admin/", "/conductor/", "/padre/"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            offline_page: "/".to_string(),
            offline_message: "Página no disponible sin conexión".to_string(),
            notification: NotificationDefaults::default(),
            sync_tags: vec!["sync-data".to_string()],
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("camley"),
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "Camley Transporte".to_string(),
            body: "Tienes una nueva notificación".to_string(),
            icon: "/static/icons/icon-192x192.png".to_string(),
            badge: "/static/icons/badge.png".to_string(),
            url: "/".to_string(),
            vibrate: vec![100, 50, 100],
            actions: vec![
                NotificationActionConfig {
                    action: "open".to_string(),
                    title: "Abrir".to_string(),
                },
                NotificationActionConfig {
                    action: "close".to_string(),
                    title: "Cerrar".to_string(),
                },
            ],
        }
    }
}

impl OfflineConfig {
    /// Load a configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            CamleyError::config_with_source(format!("invalid config {}", path.display()), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject configurations the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cache_version.trim().is_empty() {
            return Err(CamleyError::config("cache_version must not be empty"));
        }
        if let Some(bad) = self
            .precache
            .iter()
            .chain(std::iter::once(&self.offline_page))
            .find(|p| !p.starts_with('/'))
        {
            return Err(CamleyError::config(format!(
                "'{}' must be an absolute path",
                bad
            )));
        }
        if self.bypass_prefixes.iter().any(|p| p.is_empty()) {
            return Err(CamleyError::config("bypass prefixes must not be empty"));
        }
        Ok(())
    }

    /// Path of the persistent cache snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.cache_dir.join("cache-storage.json")
    }
}
