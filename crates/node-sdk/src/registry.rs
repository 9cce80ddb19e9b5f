//! Process-wide registry of live clients by broker-assigned id.
//!
//! Entries are weak: the registry never keeps a client alive.  A client is
//! inserted when it receives an id and removed when the id is cleared
//! (deregistration, reset) or the client is dropped.

use std::collections::HashMap;
use std::sync::{OnceLock, Weak};

use parking_lot::RwLock;

use crate::client::{Client, ClientInner};

#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Weak<ClientInner>>>,
}

impl ClientRegistry {
    /// The registry shared by every client in this process.
    pub fn global() -> &'static ClientRegistry {
        static REGISTRY: OnceLock<ClientRegistry> = OnceLock::new();
        REGISTRY.get_or_init(ClientRegistry::default)
    }

    /// Look up a live client by id.
    pub fn get(&self, id: &str) -> Option<Client> {
        let inner = self.clients.read().get(id)?.upgrade()?;
        Some(Client { inner })
    }

    /// Ids of live clients (sorted).
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .clients
            .read()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients
            .read()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn insert(&self, id: &str, client: &Client) {
        let previous = self
            .clients
            .write()
            .insert(id.to_string(), client.downgrade());
        if let Some(previous) = previous {
            if previous.strong_count() > 0 && !client.ptr_eq(&previous) {
                tracing::warn!(client_id = %id, "client id reused; replacing registry entry");
            }
        }
    }

    /// Remove `id` if it still points at `client` (or at nothing).
    pub(crate) fn remove(&self, id: &str, client: &Client) {
        let mut clients = self.clients.write();
        let owned = clients
            .get(id)
            .is_some_and(|weak| weak.strong_count() == 0 || client.ptr_eq(weak));
        if owned {
            clients.remove(id);
        }
    }

    /// Drop entries whose client is gone.
    pub(crate) fn prune(&self) {
        self.clients.write().retain(|_, weak| weak.strong_count() > 0);
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stub_client;

    #[test]
    fn insert_get_remove() {
        let registry = ClientRegistry::default();
        let client = stub_client("registry-a");

        registry.insert("a-1", &client);
        assert!(registry.get("a-1").unwrap().ptr_eq(&client.downgrade()));
        assert_eq!(registry.ids(), vec!["a-1"]);
        assert_eq!(registry.len(), 1);

        registry.remove("a-1", &client);
        assert!(registry.get("a-1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_leaves_other_owners_alone() {
        let registry = ClientRegistry::default();
        let first = stub_client("registry-first");
        let second = stub_client("registry-second");

        registry.insert("shared", &first);
        registry.insert("shared", &second);
        registry.remove("shared", &first);
        assert!(registry.get("shared").unwrap().ptr_eq(&second.downgrade()));
    }

    #[test]
    fn dropped_clients_disappear() {
        let registry = ClientRegistry::default();
        {
            let client = stub_client("registry-dropped");
            registry.insert("gone", &client);
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.get("gone").is_none());
        assert_eq!(registry.len(), 0);

        registry.prune();
        assert!(registry.clients.read().is_empty());
    }
}
