// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error Taxonomy
//!
//! Storage layers report [`StoreError`]; everything the relay reports back to
//! a client is a [`RelayError`].

use thiserror::Error;
use uuid::Uuid;

/// Failures of the persistence collaborators (messages, users, keys).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Username is already taken: {0}")]
    UsernameTaken(String),
}

/// Per-message and per-connection failures of the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed inbound payload. The connection stays open.
    #[error("Invalid message: {0}")]
    Validation(String),

    /// Handshake or sender/recipient lookup miss.
    #[error("Unknown identity: {0}")]
    UnknownIdentity(Uuid),

    /// Ciphertext/key mismatch. The message is dropped before persistence.
    #[error("Decryption failed: {0}")]
    DecryptionFailure(String),

    /// The underlying primitive could not be initialised (key generation).
    #[error("Cryptographic failure: {0}")]
    CryptoFailure(String),

    /// The durable record could not be written. No delivery takes place.
    #[error("Message could not be stored: {0}")]
    PersistenceFailure(StoreError),

    /// A user, key or history lookup could not be read. Nothing was written.
    #[error("Stored data could not be read: {0}")]
    LookupFailure(StoreError),

    /// A live connection rejected a write.
    #[error("Transport failure: {0}")]
    TransportFailure(String),
}

/// Failures of register-or-login.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Username and password are required")]
    MissingCredentials,

    #[error("Incorrect password")]
    WrongPassword,

    #[error("Password hashing failed: {0}")]
    Hashing(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl RelayError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "validation",
            RelayError::UnknownIdentity(_) => "unknown_identity",
            RelayError::DecryptionFailure(_) => "decryption",
            RelayError::CryptoFailure(_) => "crypto",
            RelayError::PersistenceFailure(_) => "persistence",
            RelayError::LookupFailure(_) => "lookup",
            RelayError::TransportFailure(_) => "transport",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_failures_are_reported_differently() {
        let write = RelayError::PersistenceFailure(StoreError::Corrupt("disk full".to_string()));
        let read = RelayError::LookupFailure(StoreError::Corrupt("bad uuid".to_string()));

        assert_eq!(write.kind(), "persistence");
        assert_eq!(read.kind(), "lookup");
        assert_eq!(write.to_string(), "Message could not be stored: Corrupt record: disk full");
        assert_eq!(read.to_string(), "Stored data could not be read: Corrupt record: bad uuid");
    }

    #[test]
    fn test_unknown_identity_message_names_id() {
        let id = Uuid::nil();
        let err = RelayError::UnknownIdentity(id);
        assert_eq!(
            err.to_string(),
            "Unknown identity: 00000000-0000-0000-0000-000000000000"
        );
    }
}
