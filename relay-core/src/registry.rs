use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::channel::Channel;
use crate::client::{Client, ClientSink};
use crate::error::RegistryError;

/// Id→Client map with a capacity cap. Holds the single strong reference to each `Client`
/// (spec.md §3 Ownership); every other holder of a client id resolves it back through here.
pub struct ClientRegistry {
    clients: RwLock<HashMap<u64, Arc<Client>>>,
    next_id: AtomicU64,
    max_clients: usize,
}

impl ClientRegistry {
    pub fn new(max_clients: usize) -> ClientRegistry {
        ClientRegistry {
            clients: RwLock::new(HashMap::new()),
            // ids start at 1, matching the original's atomic counter seeded before the
            // first accept (examples/original_source/include/server.hpp).
            next_id: AtomicU64::new(1),
            max_clients,
        }
    }

    pub fn add(&self, sink: Box<dyn ClientSink>) -> Result<Arc<Client>, RegistryError> {
        let mut clients = self.clients.write().unwrap();
        if clients.len() >= self.max_clients {
            return Err(RegistryError::AtCapacity);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(Client::new(id, sink));
        clients.insert(id, client.clone());
        Ok(client)
    }

    pub fn find(&self, id: u64) -> Option<Arc<Client>> {
        self.clients.read().unwrap().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Client>> {
        self.clients.write().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    pub fn is_at_capacity(&self) -> bool {
        self.len() >= self.max_clients
    }
}

/// Id→Channel map with a capacity cap. Channel ids are caller-chosen (the connecting client
/// picks one in its CH_CONNECT payload), so this registry's job is capacity-gated, race-free
/// insertion rather than id assignment.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<u32, Arc<Channel>>>,
    max_channels: usize,
}

impl ChannelRegistry {
    pub fn new(max_channels: usize) -> ChannelRegistry {
        ChannelRegistry { channels: RwLock::new(HashMap::new()), max_channels }
    }

    /// Atomically allocates the channel with `creator` as emperor, joins the creator, and
    /// inserts into the map, all under one write lock (spec.md §4.4).
    pub fn create(&self, id: u32, creator: &Client) -> Result<Arc<Channel>, RegistryError> {
        let mut channels = self.channels.write().unwrap();
        if channels.contains_key(&id) {
            return Err(RegistryError::AlreadyExists);
        }
        if channels.len() >= self.max_channels {
            return Err(RegistryError::AtCapacity);
        }
        let channel = Arc::new(Channel::new(id, creator.id()));
        creator.join(id);
        channels.insert(id, channel.clone());
        Ok(channel)
    }

    pub fn find(&self, id: u32) -> Option<Arc<Channel>> {
        self.channels.read().unwrap().get(&id).cloned()
    }

    /// Removing an already-absent id is a no-op, so a reentrant disconnect sweep that
    /// races another thread's drop of the same channel cannot panic or double-notify.
    pub fn drop(&self, id: u32) -> Option<Arc<Channel>> {
        self.channels.write().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.read().unwrap().len()
    }

    pub fn is_at_capacity(&self) -> bool {
        self.len() >= self.max_channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_wire::Frame;

    struct NullSink;
    impl ClientSink for NullSink {
        fn send_frame(&self, _frame: &Frame) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn client_ids_start_at_one_and_increment() {
        let reg = ClientRegistry::new(10);
        let a = reg.add(Box::new(NullSink)).unwrap();
        let b = reg.add(Box::new(NullSink)).unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
    }

    #[test]
    fn client_registry_rejects_over_capacity() {
        let reg = ClientRegistry::new(1);
        reg.add(Box::new(NullSink)).unwrap();
        assert_eq!(reg.add(Box::new(NullSink)).unwrap_err(), RegistryError::AtCapacity);
        assert!(reg.is_at_capacity());
    }

    #[test]
    fn client_registry_remove_then_find_returns_none() {
        let reg = ClientRegistry::new(10);
        let client = reg.add(Box::new(NullSink)).unwrap();
        assert!(reg.find(client.id()).is_some());
        reg.remove(client.id());
        assert!(reg.find(client.id()).is_none());
    }

    #[test]
    fn channel_registry_create_joins_creator_and_sets_emperor() {
        let clients = ClientRegistry::new(10);
        let channels = ChannelRegistry::new(10);
        let creator = clients.add(Box::new(NullSink)).unwrap();
        let channel = channels.create(7, &creator).unwrap();
        assert_eq!(channel.emperor_id(), Some(creator.id()));
        assert!(creator.is_member(7));
        assert_eq!(channels.len(), 1);
    }

    #[test]
    fn channel_registry_create_rejects_duplicate_id() {
        let clients = ClientRegistry::new(10);
        let channels = ChannelRegistry::new(10);
        let creator = clients.add(Box::new(NullSink)).unwrap();
        channels.create(7, &creator).unwrap();
        assert_eq!(channels.create(7, &creator).unwrap_err(), RegistryError::AlreadyExists);
    }

    #[test]
    fn channel_registry_drop_is_idempotent() {
        let clients = ClientRegistry::new(10);
        let channels = ChannelRegistry::new(10);
        let creator = clients.add(Box::new(NullSink)).unwrap();
        channels.create(7, &creator).unwrap();
        assert!(channels.drop(7).is_some());
        assert!(channels.drop(7).is_none());
    }
}
