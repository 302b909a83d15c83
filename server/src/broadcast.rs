//! Event fan-out to the connections subscribed to a race.

use log::{debug, warn};
use shared::{ConnectionId, Pin, ServerEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Where events for a single connection end up. Delivery is best-effort;
/// returns false when the connection could not be reached.
pub trait EventSink: Send + Sync {
    fn deliver(&self, connection: ConnectionId, event: &ServerEvent) -> bool;
}

impl EventSink for mpsc::UnboundedSender<(ConnectionId, ServerEvent)> {
    fn deliver(&self, connection: ConnectionId, event: &ServerEvent) -> bool {
        self.send((connection, event.clone())).is_ok()
    }
}

/// Tracks which connections listen on which race channel and hands each
/// delivery to the sink.
pub struct BroadcastGateway {
    channels: RwLock<HashMap<Pin, Vec<ConnectionId>>>,
    sink: Arc<dyn EventSink>,
}

impl BroadcastGateway {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            sink,
        }
    }

    pub async fn join_channel(&self, pin: &Pin, connection: ConnectionId) {
        let mut channels = self.channels.write().await;
        let members = channels.entry(pin.clone()).or_default();
        if !members.contains(&connection) {
            members.push(connection);
        }
    }

    pub async fn leave_channel(&self, pin: &Pin, connection: ConnectionId) {
        let mut channels = self.channels.write().await;
        if let Some(members) = channels.get_mut(pin) {
            members.retain(|c| *c != connection);
            if members.is_empty() {
                channels.remove(pin);
            }
        }
    }

    /// Drops the channel, returning whoever was still subscribed.
    pub async fn close_channel(&self, pin: &Pin) -> Vec<ConnectionId> {
        self.channels.write().await.remove(pin).unwrap_or_default()
    }

    pub async fn members(&self, pin: &Pin) -> Vec<ConnectionId> {
        self.channels
            .read()
            .await
            .get(pin)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn emit_to_channel(
        &self,
        pin: &Pin,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) {
        let members = self.members(pin).await;
        let mut recipients = 0u32;
        for connection in members {
            if Some(connection) == exclude {
                continue;
            }
            recipients += 1;
            if !self.sink.deliver(connection, event) {
                warn!(
                    "Failed to deliver {} to connection {}",
                    event.name(),
                    connection
                );
            }
        }
        debug!(
            "Broadcast {} on {} to {} connections",
            event.name(),
            pin,
            recipients
        );
    }

    pub async fn emit_to_connection(&self, connection: ConnectionId, event: &ServerEvent) {
        if !self.sink.deliver(connection, event) {
            warn!(
                "Failed to deliver {} to connection {}",
                event.name(),
                connection
            );
        }
    }
}
