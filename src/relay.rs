// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Engine
//!
//! Turns one inbound chat frame into delivered plaintext:
//!
//! 1. decode and check the frame against the connection's identity
//! 2. decrypt with the sender's private key
//! 3. compare the claimed digest with the recomputed one
//! 4. persist the original ciphertext and claimed digest
//! 5. push the plaintext envelope to the sender and the recipient
//!
//! Each stage returns a [`RelayError`] that stops the pipeline. A digest
//! mismatch is not a stage failure: the message is still stored and
//! delivered, flagged with `is_integrity_valid = false`.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection_registry::{ConnectionRegistry, RegistryMessage};
use crate::error::RelayError;
use crate::integrity;
use crate::key_vault::KeyVault;
use crate::message_store::{MessageStore, StoredMessage};
use crate::metrics::RelayMetrics;
use crate::protocol::{
    decode_frame, encode_frame, ChatMessageIn, InboundFrame, OutboundFrame, PlaintextEnvelope,
};
use crate::user_directory::{display_name, UserDirectory, UserRecord};

/// Result of a successful relay.
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub envelope: PlaintextEnvelope,
    /// Whether the echo reached a live connection of the sender.
    pub delivered_to_sender: bool,
    /// Whether a live connection of the recipient received the message.
    /// Always `false` for messages a user sends to themselves.
    pub delivered_to_recipient: bool,
}

/// Decrypts a base64 ciphertext with `owner`'s key and returns the UTF-8
/// plaintext. Blocking.
fn open_ciphertext(vault: &KeyVault, owner: &Uuid, ciphertext: &str) -> Result<String, RelayError> {
    let bytes = BASE64
        .decode(ciphertext.trim())
        .map_err(|e| RelayError::Validation(format!("encrypted_content is not base64: {}", e)))?;
    let plaintext = vault.decrypt(owner, &bytes)?;
    String::from_utf8(plaintext)
        .map_err(|_| RelayError::DecryptionFailure("plaintext is not valid UTF-8".to_string()))
}

/// Orchestrates the relay of chat messages between connected users.
pub struct RelayEngine {
    vault: Arc<KeyVault>,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn UserDirectory>,
    registry: Arc<ConnectionRegistry>,
    metrics: RelayMetrics,
}

impl RelayEngine {
    pub fn new(
        vault: Arc<KeyVault>,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn UserDirectory>,
        registry: Arc<ConnectionRegistry>,
        metrics: RelayMetrics,
    ) -> Self {
        // Seeded once; relays increment it from here on.
        metrics.messages_stored.set(store.message_count() as i64);
        RelayEngine {
            vault,
            store,
            directory,
            registry,
            metrics,
        }
    }

    /// The registry this engine delivers through.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Looks up a registered user.
    pub fn resolve_identity(&self, id: &Uuid) -> Result<Option<UserRecord>, RelayError> {
        self.directory.find_by_id(id).map_err(RelayError::LookupFailure)
    }

    /// Decodes a text frame from `origin` and dispatches it.
    pub async fn handle_frame(&self, origin: Uuid, text: &str) -> Result<RelayOutcome, RelayError> {
        match decode_frame(text)? {
            InboundFrame::ChatMessage(msg) => self.relay(origin, msg).await,
        }
    }

    /// Relays one chat message sent by the connection authenticated as `origin`.
    pub async fn relay(&self, origin: Uuid, msg: ChatMessageIn) -> Result<RelayOutcome, RelayError> {
        let _timer = self.metrics.relay_duration.start_timer();

        if msg.sender_id != origin {
            return Err(RelayError::Validation(
                "sender_id does not match the connected user".to_string(),
            ));
        }
        let recipient = self
            .directory
            .find_by_id(&msg.recipient_id)
            .map_err(RelayError::LookupFailure)?;
        if recipient.is_none() {
            return Err(RelayError::UnknownIdentity(msg.recipient_id));
        }

        let content = {
            let vault = self.vault.clone();
            let sender = msg.sender_id;
            let ciphertext = msg.encrypted_content.clone();
            tokio::task::spawn_blocking(move || open_ciphertext(&vault, &sender, &ciphertext))
                .await
                .map_err(|e| RelayError::CryptoFailure(format!("decryption task: {}", e)))??
        };

        let integrity_valid = integrity::verify(&content, &msg.message_hash);
        if !integrity_valid {
            self.metrics.integrity_failures.inc();
            warn!("Integrity digest mismatch, delivering flagged message");
        }

        let stored = self
            .store
            .append(
                msg.sender_id,
                msg.recipient_id,
                &msg.encrypted_content,
                &msg.message_hash,
            )
            .map_err(RelayError::PersistenceFailure)?;
        self.metrics.messages_stored.inc();

        let envelope = self.envelope(&stored, content, integrity_valid);
        let frame = encode_frame(&OutboundFrame::ChatMessage(envelope.clone()))
            .map_err(|e| RelayError::TransportFailure(e.to_string()))?;

        let delivered_to_sender = self.deliver(&stored.sender_id, &frame);
        let delivered_to_recipient =
            stored.recipient_id != stored.sender_id && self.deliver(&stored.recipient_id, &frame);

        self.metrics.messages_relayed.inc();
        debug!(
            "Relayed message (sender live: {}, recipient live: {})",
            delivered_to_sender, delivered_to_recipient
        );

        Ok(RelayOutcome {
            envelope,
            delivered_to_sender,
            delivered_to_recipient,
        })
    }

    /// Returns the decrypted conversation between `a` and `b`, oldest first.
    ///
    /// Records that no longer decrypt are skipped.
    pub async fn history(&self, a: Uuid, b: Uuid) -> Result<Vec<PlaintextEnvelope>, RelayError> {
        let records = self
            .store
            .find_between(&a, &b)
            .map_err(RelayError::LookupFailure)?;
        let vault = self.vault.clone();

        let opened = tokio::task::spawn_blocking(move || {
            records
                .into_iter()
                .filter_map(|record| {
                    match open_ciphertext(&vault, &record.sender_id, &record.ciphertext) {
                        Ok(content) => Some((record, content)),
                        Err(e) => {
                            warn!("Skipping unreadable history record: {}", e);
                            None
                        }
                    }
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| RelayError::CryptoFailure(format!("history task: {}", e)))?;

        Ok(opened
            .into_iter()
            .map(|(record, content)| {
                let integrity_valid = integrity::verify(&content, &record.integrity_digest);
                self.envelope(&record, content, integrity_valid)
            })
            .collect())
    }

    fn envelope(&self, record: &StoredMessage, content: String, integrity_valid: bool) -> PlaintextEnvelope {
        let mut names: HashMap<Uuid, String> = HashMap::new();
        let mut name_of = |id: Uuid| {
            names
                .entry(id)
                .or_insert_with(|| display_name(self.directory.as_ref(), &id))
                .clone()
        };
        PlaintextEnvelope {
            id: record.id,
            content,
            created_at: record.created_at,
            sender_id: record.sender_id,
            sender_username: name_of(record.sender_id),
            recipient_id: record.recipient_id,
            recipient_username: name_of(record.recipient_id),
            integrity_valid,
        }
    }

    fn deliver(&self, user_id: &Uuid, frame: &str) -> bool {
        let delivered = self.registry.send_if_present(
            user_id,
            RegistryMessage {
                data: frame.to_string(),
            },
        );
        if delivered {
            self.metrics.deliveries_live.inc();
        } else {
            self.metrics.deliveries_missed.inc();
        }
        delivered
    }
}
