//! Connection → race membership index.

use log::debug;
use shared::{ConnectionId, Pin};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Maps each live connection to at most one race, so a disconnect finds its
/// race without scanning every race.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    memberships: RwLock<HashMap<ConnectionId, Pin>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a connection to a race, returning the binding it replaced.
    pub async fn bind(&self, connection: ConnectionId, pin: Pin) -> Option<Pin> {
        debug!("Connection {} bound to race {}", connection, pin);
        self.memberships.write().await.insert(connection, pin)
    }

    pub async fn lookup(&self, connection: ConnectionId) -> Option<Pin> {
        self.memberships.read().await.get(&connection).cloned()
    }

    pub async fn unbind(&self, connection: ConnectionId) -> Option<Pin> {
        self.memberships.write().await.remove(&connection)
    }

    /// Clears the binding only while it still points at `pin`.
    pub async fn unbind_if(&self, connection: ConnectionId, pin: &Pin) -> bool {
        let mut memberships = self.memberships.write().await;
        if memberships.get(&connection) == Some(pin) {
            memberships.remove(&connection);
            true
        } else {
            false
        }
    }

    pub async fn len(&self) -> usize {
        self.memberships.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.memberships.read().await.is_empty()
    }
}
