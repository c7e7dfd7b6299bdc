// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message Storage
//!
//! Append-only record of relayed chat messages, kept in their encrypted form.
//! Supports both in-memory (for testing) and SQLite (for production).

use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::StoreError;

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Unique message ID.
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    /// The ciphertext exactly as the client sent it (base64 text).
    pub ciphertext: String,
    /// The client's claimed SHA-256 digest of the plaintext (hex).
    pub integrity_digest: String,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Creates a new record stamped with the current time, at the
    /// microsecond precision the SQLite backend keeps.
    pub fn new(
        sender_id: Uuid,
        recipient_id: Uuid,
        ciphertext: String,
        integrity_digest: String,
    ) -> Self {
        StoredMessage {
            id: Uuid::new_v4(),
            sender_id,
            recipient_id,
            ciphertext,
            integrity_digest,
            created_at: Utc::now().trunc_subsecs(6),
        }
    }

    /// Returns whether the message was exchanged between `a` and `b`, in
    /// either direction.
    pub fn is_between(&self, a: &Uuid, b: &Uuid) -> bool {
        (self.sender_id == *a && self.recipient_id == *b)
            || (self.sender_id == *b && self.recipient_id == *a)
    }
}

/// Trait for message storage backends.
pub trait MessageStore: Send + Sync {
    /// Durably records one message and returns the stored record.
    fn append(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        ciphertext: &str,
        integrity_digest: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// Returns every message exchanged between `a` and `b`, oldest first.
    fn find_between(&self, a: &Uuid, b: &Uuid) -> Result<Vec<StoredMessage>, StoreError>;

    /// Returns the total number of stored messages.
    fn message_count(&self) -> usize;
}

// ============================================================================
// In-Memory Storage (for testing and development)
// ============================================================================

/// In-memory message log in arrival order.
pub struct MemoryMessageStore {
    messages: RwLock<Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    /// Creates a new empty in-memory storage.
    pub fn new() -> Self {
        MemoryMessageStore {
            messages: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryMessageStore {
    fn append(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        ciphertext: &str,
        integrity_digest: &str,
    ) -> Result<StoredMessage, StoreError> {
        let message = StoredMessage::new(
            sender_id,
            recipient_id,
            ciphertext.to_string(),
            integrity_digest.to_string(),
        );
        let mut messages = self
            .messages
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        messages.push(message.clone());
        Ok(message)
    }

    fn find_between(&self, a: &Uuid, b: &Uuid) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<StoredMessage> = messages
            .iter()
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect();
        // Stable sort keeps arrival order for equal timestamps.
        found.sort_by_key(|m| m.created_at);
        Ok(found)
    }

    fn message_count(&self) -> usize {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// ============================================================================
// SQLite Storage (for production)
// ============================================================================

/// SQLite-backed persistent message storage.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL allows readers and writers to operate concurrently
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=10000;",
        )?;

        // seq preserves arrival order among equal timestamps
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                sender_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                ciphertext TEXT NOT NULL,
                integrity_digest TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender_id, recipient_id)",
            [],
        )?;

        Ok(SqliteMessageStore {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }
}

fn parse_uuid(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|e| StoreError::Corrupt(format!("uuid {}: {}", text, e)))
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {}: {}", text, e)))
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl MessageStore for SqliteMessageStore {
    fn append(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        ciphertext: &str,
        integrity_digest: &str,
    ) -> Result<StoredMessage, StoreError> {
        let message = StoredMessage::new(
            sender_id,
            recipient_id,
            ciphertext.to_string(),
            integrity_digest.to_string(),
        );
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO messages (id, sender_id, recipient_id, ciphertext, integrity_digest, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id.to_string(),
                message.sender_id.to_string(),
                message.recipient_id.to_string(),
                message.ciphertext,
                message.integrity_digest,
                format_timestamp(&message.created_at),
            ],
        )?;
        Ok(message)
    }

    fn find_between(&self, a: &Uuid, b: &Uuid) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, recipient_id, ciphertext, integrity_digest, created_at
             FROM messages
             WHERE (sender_id = ?1 AND recipient_id = ?2)
                OR (sender_id = ?2 AND recipient_id = ?1)
             ORDER BY created_at ASC, seq ASC",
        )?;

        let rows = stmt.query_map(params![a.to_string(), b.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, sender, recipient, ciphertext, integrity_digest, created_at) = row?;
            messages.push(StoredMessage {
                id: parse_uuid(&id)?,
                sender_id: parse_uuid(&sender)?,
                recipient_id: parse_uuid(&recipient)?,
                ciphertext,
                integrity_digest,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(messages)
    }

    fn message_count(&self) -> usize {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// In-memory storage (lost on restart).
    Memory,
    /// SQLite persistent storage.
    #[default]
    Sqlite,
}

/// Creates a message store based on the backend type.
pub fn create_message_store(
    backend: StorageBackend,
    data_dir: &Path,
) -> Result<Box<dyn MessageStore>, StoreError> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryMessageStore::new())),
        StorageBackend::Sqlite => {
            let _ = std::fs::create_dir_all(data_dir);
            Ok(Box::new(SqliteMessageStore::open(
                data_dir.join("messages.db"),
            )?))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
