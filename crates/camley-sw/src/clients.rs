//! Clients API: the pages a worker can see, message, focus and open.

use crate::event::{detached_sender, EventSender, ServiceWorkerEvent};
use crate::worker::ServiceWorkerId;
use crate::ServiceWorkerError;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use url::Url;

/// Client identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

/// A client (page or worker).
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    /// Worker controlling this client, if any.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// A window client at `url`, not yet controlled.
    pub fn window(url: Url) -> Self {
        Self {
            id: ClientId::new(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }
}

/// Options for `match_all`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

impl ClientMatchOptions {
    /// Every window, controlled or not.
    pub fn all_windows() -> Self {
        Self {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        }
    }
}

/// Clients API.
#[derive(Debug)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
    events: EventSender,
}

impl Default for Clients {
    fn default() -> Self {
        Self::new(detached_sender())
    }
}

impl Clients {
    /// Create a clients manager reporting to `events`.
    pub fn new(events: EventSender) -> Self {
        Self {
            clients: HashMap::new(),
            events,
        }
    }

    /// Get a client by ID.
    pub fn get(&self, id: &ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) -> ClientId {
        let id = client.id.clone();
        self.clients.insert(id.clone(), client);
        id
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &ClientId) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Clients visible to `worker`, sorted by id.
    pub fn match_all(&self, worker: ServiceWorkerId, options: ClientMatchOptions) -> Vec<&Client> {
        let mut matched: Vec<_> = self
            .clients
            .values()
            .filter(|c| options.include_uncontrolled || c.controller == Some(worker))
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Make `worker` the controller of every window client under `scope`.
    /// Returns how many clients changed controller.
    pub fn claim(&mut self, worker: ServiceWorkerId, scope: &Url) -> usize {
        let mut changed = 0;
        for client in self.clients.values_mut() {
            if client.client_type != ClientType::Window
                || !client.url.as_str().starts_with(scope.as_str())
                || client.controller == Some(worker)
            {
                continue;
            }
            client.controller = Some(worker);
            changed += 1;
            let _ = self.events.send(ServiceWorkerEvent::ControllerChange {
                client_id: client.id.clone(),
                worker_id: worker,
            });
        }
        debug!(worker = ?worker, changed, "Clients claimed");
        changed
    }

    /// Post a message to a client.
    pub fn post_message(
        &self,
        id: &ClientId,
        data: serde_json::Value,
    ) -> Result<(), ServiceWorkerError> {
        if !self.clients.contains_key(id) {
            return Err(ServiceWorkerError::NotFound(id.to_string()));
        }
        let _ = self.events.send(ServiceWorkerEvent::ClientMessage {
            client_id: id.clone(),
            data,
        });
        Ok(())
    }

    /// Focus a window client. Every other client loses focus.
    pub fn focus(&mut self, id: &ClientId) -> Result<Client, ServiceWorkerError> {
        match self.clients.get(id) {
            None => return Err(ServiceWorkerError::NotFound(id.to_string())),
            Some(c) if c.client_type != ClientType::Window => {
                return Err(ServiceWorkerError::StateError(
                    "Can only focus window clients".to_string(),
                ))
            }
            Some(_) => {}
        }

        for client in self.clients.values_mut() {
            client.focused = &client.id == id;
        }
        let _ = self.events.send(ServiceWorkerEvent::ClientFocused {
            client_id: id.clone(),
        });
        self.clients
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(id.to_string()))
    }

    /// Open a new focused window at `url`.
    pub fn open_window(&mut self, url: Url) -> Client {
        let mut client = Client::window(url);
        client.focused = true;
        for other in self.clients.values_mut() {
            other.focused = false;
        }
        let _ = self.events.send(ServiceWorkerEvent::WindowOpened {
            client_id: client.id.clone(),
            url: client.url.to_string(),
        });
        self.clients.insert(client.id.clone(), client.clone());
        client
    }
}
