// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Registry
//!
//! Tracks which users currently hold a live WebSocket so the relay can push
//! chat frames to them.
//!
//! The registry maps a user identity to the sending half of a channel. The
//! connection task owning the socket drains the receiving half and writes
//! each frame to the wire. At most one entry exists per user; a reconnect
//! replaces the previous entry and the old receiver sees its channel close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

/// Frames buffered per connection before `send_if_present` starts dropping.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// A message that can be sent to a connected client via the registry.
#[derive(Debug, Clone)]
pub struct RegistryMessage {
    /// The encoded JSON text frame to send over WebSocket.
    pub data: String,
}

/// Handle returned by [`ConnectionRegistry::register`].
#[derive(Debug)]
pub struct Registration {
    /// Identifies this particular registration of the user.
    pub connection_id: u64,
    /// Frames addressed to the user while this registration is current.
    pub receiver: mpsc::Receiver<RegistryMessage>,
}

struct ConnectionEntry {
    connection_id: u64,
    tx: mpsc::Sender<RegistryMessage>,
}

/// Thread-safe registry of connected users.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
    next_connection_id: AtomicU64,
    buffer: usize,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_OUTBOUND_BUFFER)
    }

    /// Creates a registry whose per-connection channels hold `buffer` frames.
    pub fn with_buffer(buffer: usize) -> Self {
        ConnectionRegistry {
            connections: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Registers a connected user and returns the receiving end of its channel.
    ///
    /// If the user was already registered (reconnection), the old channel is
    /// replaced and the old receiver will see the channel close.
    pub fn register(&self, user_id: Uuid) -> Registration {
        let (tx, receiver) = mpsc::channel(self.buffer);
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if connections
            .insert(user_id, ConnectionEntry { connection_id, tx })
            .is_some()
        {
            debug!("Replaced existing connection entry");
        }
        Registration {
            connection_id,
            receiver,
        }
    }

    /// Removes the entry for `user_id`, if any. Idempotent.
    pub fn deregister(&self, user_id: &Uuid) {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        connections.remove(user_id);
    }

    /// Removes the entry for `user_id` only if it still belongs to
    /// `connection_id`. Returns whether an entry was removed.
    ///
    /// A session that ends after its user reconnected elsewhere must not evict
    /// the newer connection.
    pub fn release(&self, user_id: &Uuid, connection_id: u64) -> bool {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match connections.get(user_id) {
            Some(entry) if entry.connection_id == connection_id => {
                connections.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Sends a frame to a connected user.
    ///
    /// Returns `true` if the frame was handed to the user's live connection,
    /// `false` if the user is offline, the connection went away (the entry is
    /// then removed), or its outbound buffer is full.
    pub fn send_if_present(&self, user_id: &Uuid, msg: RegistryMessage) -> bool {
        let target = {
            let connections = self
                .connections
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            connections
                .get(user_id)
                .map(|entry| (entry.connection_id, entry.tx.clone()))
        };

        let Some((connection_id, tx)) = target else {
            return false;
        };

        match tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Outbound buffer full, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Connection closed during send, removing entry");
                self.release(user_id, connection_id);
                false
            }
        }
    }

    /// Returns whether `user_id` currently has a live entry.
    pub fn is_connected(&self, user_id: &Uuid) -> bool {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        connections.contains_key(user_id)
    }

    /// Returns the number of currently connected users.
    pub fn connected_count(&self) -> usize {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(text: &str) -> RegistryMessage {
        RegistryMessage {
            data: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_and_send() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let mut reg = registry.register(user);

        assert!(registry.send_if_present(&user, frame("hi")));

        let received = reg.receiver.recv().await.unwrap();
        assert_eq!(received.data, "hi");
    }

    #[tokio::test]
    async fn test_send_to_unknown_user_is_not_delivered() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_if_present(&Uuid::new_v4(), frame("hi")));
        assert_eq!(registry.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let _reg = registry.register(user);

        assert_eq!(registry.connected_count(), 1);
        registry.deregister(&user);
        registry.deregister(&user);
        assert_eq!(registry.connected_count(), 0);

        assert!(!registry.send_if_present(&user, frame("hi")));
    }

    #[tokio::test]
    async fn test_reconnection_replaces_channel() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let mut old = registry.register(user);
        let mut new = registry.register(user);

        assert_eq!(registry.connected_count(), 1);
        assert!(registry.send_if_present(&user, frame("after reconnect")));

        assert_eq!(new.receiver.recv().await.unwrap().data, "after reconnect");
        // The replaced sender was dropped, so the old receiver is closed and empty.
        assert!(old.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stale_release_keeps_newer_connection() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let old = registry.register(user);
        let _new = registry.register(user);

        assert!(!registry.release(&user, old.connection_id));
        assert!(registry.is_connected(&user));
    }

    #[tokio::test]
    async fn test_closed_transport_is_removed_on_send() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let reg = registry.register(user);
        drop(reg.receiver);

        assert!(!registry.send_if_present(&user, frame("lost")));
        assert!(!registry.is_connected(&user));
    }

    #[tokio::test]
    async fn test_full_buffer_drops_without_deregistering() {
        let registry = ConnectionRegistry::with_buffer(1);
        let user = Uuid::new_v4();
        let mut reg = registry.register(user);

        assert!(registry.send_if_present(&user, frame("one")));
        assert!(!registry.send_if_present(&user, frame("two")));
        assert!(registry.is_connected(&user));
        assert_eq!(reg.receiver.recv().await.unwrap().data, "one");
    }

    #[tokio::test]
    async fn test_multiple_users() {
        let registry = ConnectionRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx_a = registry.register(a);
        let mut rx_b = registry.register(b);

        assert_eq!(registry.connected_count(), 2);

        registry.send_if_present(&a, frame("for a"));
        registry.send_if_present(&b, frame("for b"));

        assert_eq!(rx_a.receiver.recv().await.unwrap().data, "for a");
        assert_eq!(rx_b.receiver.recv().await.unwrap().data, "for b");
    }

    #[tokio::test]
    async fn test_concurrent_register_and_deregister() {
        let registry = Arc::new(ConnectionRegistry::new());
        let users: Vec<Uuid> = (0..32).map(|_| Uuid::new_v4()).collect();

        let mut handles = Vec::new();
        for user in users.clone() {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let reg = registry.register(user);
                    registry.send_if_present(&user, RegistryMessage {
                        data: "x".to_string(),
                    });
                    registry.release(&user, reg.connection_id);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.connected_count(), 0);
    }
}
