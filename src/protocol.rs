// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! JSON text frames exchanged over the WebSocket, tagged by `type` with the
//! body under `payload`:
//!
//! ```text
//! {"type":"CHAT_MESSAGE","payload":{...}}
//! {"type":"ERROR","payload":{"error":"..."}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RelayError;

/// An encrypted chat message submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessageIn {
    /// Base64 RSA-OAEP(SHA-256) ciphertext under the sender's public key.
    pub encrypted_content: String,
    /// Claimed SHA-256 of the plaintext, lowercase hex.
    pub message_hash: String,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
}

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum InboundFrame {
    #[serde(rename = "CHAT_MESSAGE")]
    ChatMessage(ChatMessageIn),
}

/// A decrypted message as delivered to clients. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaintextEnvelope {
    pub id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub recipient_id: Uuid,
    pub recipient_username: String,
    #[serde(rename = "is_integrity_valid")]
    pub integrity_valid: bool,
}

/// Frames the relay sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum OutboundFrame {
    #[serde(rename = "CHAT_MESSAGE")]
    ChatMessage(PlaintextEnvelope),
    #[serde(rename = "ERROR")]
    Error { error: String },
}

impl OutboundFrame {
    /// Error frame reporting `err` to the originating connection.
    pub fn error(err: &RelayError) -> Self {
        OutboundFrame::Error {
            error: err.to_string(),
        }
    }
}

/// Decodes a client text frame.
pub fn decode_frame(text: &str) -> Result<InboundFrame, RelayError> {
    serde_json::from_str(text).map_err(|e| RelayError::Validation(e.to_string()))
}

/// Encodes a relay frame as JSON text.
pub fn encode_frame(frame: &OutboundFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}
