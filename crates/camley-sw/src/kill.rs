//! Kill switch: a replacement worker that wipes every cache, unregisters
//! itself and tells open pages it is gone.

use crate::clients::{ClientId, ClientMatchOptions};
use crate::worker::{InstallOutcome, WorkerScope, WorkerScript};
use crate::ServiceWorkerError;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tracing::{debug, info, warn};

/// `type` of the message broadcast once cleanup is done.
pub const CLEARED_MESSAGE: &str = "SW_CLEARED";

/// Decommissioning worker. Installs without a manifest and never handles
/// fetches, so once unregistered every request goes to the network.
///
/// Each cleanup step runs even if an earlier one failed; failures are
/// logged and dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct KillSwitchWorker;

impl KillSwitchWorker {
    pub fn new() -> Self {
        Self
    }

    async fn delete_all_caches(&self, scope: &WorkerScope) -> usize {
        let names = match scope.caches.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Listing caches failed");
                return 0;
            }
        };

        let results = join_all(names.into_iter().map(|name| async move {
            let result = scope.caches.delete(&name).await;
            (name, result)
        }))
        .await;

        let mut deleted = 0;
        for (name, result) in results {
            match result {
                Ok(_) => {
                    debug!(cache = %name, "Deleted cache");
                    deleted += 1;
                }
                Err(e) => warn!(cache = %name, error = %e, "Deleting cache failed"),
            }
        }
        deleted
    }

    async fn notify_clients(&self, scope: &WorkerScope) -> usize {
        let clients = scope.clients.read().await;
        let targets: Vec<ClientId> = clients
            .match_all(scope.worker_id, ClientMatchOptions::all_windows())
            .into_iter()
            .map(|client| client.id.clone())
            .collect();

        let mut notified = 0;
        for id in targets {
            match clients.post_message(&id, json!({ "type": CLEARED_MESSAGE })) {
                Ok(()) => notified += 1,
                Err(e) => warn!(client = %id, error = %e, "Notifying client failed"),
            }
        }
        notified
    }
}

#[async_trait]
impl WorkerScript for KillSwitchWorker {
    fn name(&self) -> &str {
        "kill-switch"
    }

    async fn on_install(&self, _scope: &WorkerScope) -> Result<InstallOutcome, ServiceWorkerError> {
        info!("Kill switch installing");
        Ok(InstallOutcome { skip_waiting: true })
    }

    async fn on_activate(&self, scope: &WorkerScope) -> Result<(), ServiceWorkerError> {
        let deleted = self.delete_all_caches(scope).await;

        if !scope.unregister().await {
            warn!(scope = %scope.scope, "Registration was already gone");
        }

        let notified = self.notify_clients(scope).await;
        info!(scope = %scope.scope, deleted, notified, "Kill switch finished");
        Ok(())
    }
}
