use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use codedrop_core::protocol::EventEnvelope;
use codedrop_core::OwnerKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use crate::broker::{BrokerConfig, BrokerError, Connection, ConnectionId, Delivery};

type ConnectionSet = HashMap<ConnectionId, Arc<dyn Connection>>;

/// Live realtime connections grouped by owner key.
///
/// Each owner key's set is guarded by its map shard, so mutations and
/// fan-outs for unrelated owners proceed independently. A key whose set
/// becomes empty is removed.
pub struct ConnectionRegistry {
    config: BrokerConfig,
    next_connection_id: AtomicU64,
    connections: DashMap<OwnerKey, ConnectionSet>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            next_connection_id: AtomicU64::new(1),
            connections: DashMap::new(),
        }
    }

    pub fn register(
        &self,
        owner: OwnerKey,
        connection: Arc<dyn Connection>,
    ) -> Result<ConnectionId, BrokerError> {
        let limit = self.config.max_connections_per_owner;
        let connection_id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        match self.connections.entry(owner) {
            Entry::Occupied(mut entry) => {
                if entry.get().len() >= limit {
                    return Err(BrokerError::TooManyConnections);
                }
                entry.get_mut().insert(connection_id, connection);
            }
            Entry::Vacant(entry) => {
                if limit == 0 {
                    return Err(BrokerError::TooManyConnections);
                }
                entry.insert(HashMap::from([(connection_id, connection)]));
            }
        }
        Ok(connection_id)
    }

    /// Removes one connection. Returns false when it was not registered.
    pub fn unregister(&self, owner: &OwnerKey, connection_id: ConnectionId) -> bool {
        let removed = self
            .connections
            .get_mut(owner)
            .is_some_and(|mut set| set.remove(&connection_id).is_some());
        self.connections.remove_if(owner, |_, set| set.is_empty());
        removed
    }

    /// Sends `{"event": event, "data": data}` to every open connection of `owner`.
    /// Returns the number of connections that accepted the frame.
    pub fn notify<T: Serialize>(&self, owner: &OwnerKey, event: &str, data: &T) -> usize {
        if !self.connections.contains_key(owner) {
            return 0;
        }
        match EventEnvelope::new(event, data).to_json() {
            Ok(frame) => self.notify_frame(owner, Arc::from(frame)),
            Err(error) => {
                tracing::error!(owner = %owner, event, error = %error, "failed to encode realtime event");
                0
            }
        }
    }

    /// Fans an already-encoded frame out to `owner`'s connections.
    pub fn notify_frame(&self, owner: &OwnerKey, frame: Arc<str>) -> usize {
        let recipients = self
            .connections
            .get(owner)
            .map(|set| {
                set.iter()
                    .map(|(connection_id, connection)| (*connection_id, Arc::clone(connection)))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let mut delivered = 0;
        let mut stale = Vec::new();
        for (connection_id, connection) in recipients {
            if connection.is_closed() {
                stale.push(connection_id);
                continue;
            }
            match connection.send(Arc::clone(&frame)) {
                Delivery::Sent => delivered += 1,
                Delivery::Dropped => {
                    tracing::debug!(owner = %owner, connection = connection_id.0, "outbound queue full; event dropped");
                }
                Delivery::Closed => stale.push(connection_id),
            }
        }

        for connection_id in stale {
            self.unregister(owner, connection_id);
        }
        delivered
    }

    /// Drops every connection whose transport has closed. Returns how many were removed.
    pub fn prune_closed(&self) -> usize {
        let mut removed = 0;
        self.connections.retain(|_, set| {
            let before = set.len();
            set.retain(|_, connection| !connection.is_closed());
            removed += before - set.len();
            !set.is_empty()
        });
        removed
    }

    #[must_use]
    pub fn connection_count(&self, owner: &OwnerKey) -> usize {
        self.connections.get(owner).map_or(0, |set| set.len())
    }

    #[must_use]
    pub fn total_connections(&self) -> usize {
        self.connections.iter().map(|entry| entry.value().len()).sum()
    }

    #[must_use]
    pub fn owner_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn contains_owner(&self, owner: &OwnerKey) -> bool {
        self.connections.contains_key(owner)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
