// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Status notifications produced by the master and the slave
//!
//! Events are broadcast; publishing never waits for a consumer and a
//! missing consumer is not an error.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// A client connection opened or closed on the slave
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientEvent {
    /// Per-slave sequence number of the connection
    pub client_id: u64,
    pub peer: SocketAddr,
    pub connected: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StatusEvent {
    /// The slave is running and ready to accept connections, or not
    ServiceRunning(bool),
    /// The master holds a live session, or not
    MasterConnected(bool),
    Client(ClientEvent),
}

#[derive(Debug, Clone)]
pub struct StatusNotifier {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StatusEvent) {
        debug!("Status event: {:?}", event);
        // No subscriber is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let notifier = StatusNotifier::new();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.publish(StatusEvent::ServiceRunning(true));

        assert_eq!(first.recv().await.unwrap(), StatusEvent::ServiceRunning(true));
        assert_eq!(second.recv().await.unwrap(), StatusEvent::ServiceRunning(true));
    }

    #[test]
    fn test_publish_without_subscriber() {
        let notifier = StatusNotifier::default();
        notifier.publish(StatusEvent::MasterConnected(false));
    }
}
