// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! User Directory
//!
//! Registered users, their display names and password hashes. The relay uses
//! it to authenticate the identity in a WebSocket path and to label outbound
//! messages; the HTTP API uses it for register-or-login and the user list.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rand::rngs::OsRng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AccountError, RelayError, StoreError};
use crate::key_vault::KeyVault;
use crate::message_store::StorageBackend;

/// Display name used when a user cannot be found.
pub const UNKNOWN_USERNAME: &str = "unknown";

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    /// Argon2 PHC string.
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Public view of a user, as served to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    /// Hex-encoded SPKI DER.
    pub public_key: String,
}

/// Trait for user directory backends.
pub trait UserDirectory: Send + Sync {
    /// Creates a user. Fails with [`StoreError::UsernameTaken`] if the name is in use.
    fn create_user(&self, username: &str, password_hash: &str) -> Result<UserRecord, StoreError>;

    /// Looks a user up by identity.
    fn find_by_id(&self, id: &Uuid) -> Result<Option<UserRecord>, StoreError>;

    /// Looks a user up by username.
    fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Lists all users in registration order.
    fn list_users(&self) -> Result<Vec<UserRecord>, StoreError>;
}

/// Resolves the display name of `id`, falling back to [`UNKNOWN_USERNAME`].
pub fn display_name(directory: &dyn UserDirectory, id: &Uuid) -> String {
    match directory.find_by_id(id) {
        Ok(Some(user)) => user.username,
        Ok(None) => UNKNOWN_USERNAME.to_string(),
        Err(e) => {
            warn!("Display name lookup failed: {}", e);
            UNKNOWN_USERNAME.to_string()
        }
    }
}

// ============================================================================
// Accounts
// ============================================================================

fn hash_password(password: &str) -> Result<String, AccountError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AccountError::Hashing(e.to_string()))
}

fn verify_password(password: &str, password_hash: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Logs an existing user in, or registers them if the username is new.
///
/// New users get a key pair provisioned before this returns. CPU-heavy
/// (Argon2 and RSA key generation); call from a blocking context.
pub fn register_or_login(
    directory: &dyn UserDirectory,
    vault: &KeyVault,
    username: &str,
    password: &str,
) -> Result<UserProfile, AccountError> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err(AccountError::MissingCredentials);
    }

    let user = match directory.find_by_username(username)? {
        Some(existing) => existing,
        None => {
            let password_hash = hash_password(password)?;
            match directory.create_user(username, &password_hash) {
                Ok(created) => {
                    info!("Registered new user");
                    created
                }
                // Lost a registration race; treat it as a login.
                Err(StoreError::UsernameTaken(_)) => directory
                    .find_by_username(username)?
                    .ok_or_else(|| StoreError::Corrupt("user vanished after insert".into()))?,
                Err(e) => return Err(e.into()),
            }
        }
    };

    if !verify_password(password, &user.password_hash) {
        return Err(AccountError::WrongPassword);
    }

    let public_key = vault.provision(user.id)?;
    Ok(UserProfile {
        id: user.id,
        username: user.username,
        public_key,
    })
}

/// Lists every user that has a public key on file.
pub fn list_profiles(
    directory: &dyn UserDirectory,
    vault: &KeyVault,
) -> Result<Vec<UserProfile>, StoreError> {
    let mut profiles = Vec::new();
    for user in directory.list_users()? {
        match vault.public_key_hex(&user.id) {
            Ok(public_key) => profiles.push(UserProfile {
                id: user.id,
                username: user.username,
                public_key,
            }),
            Err(RelayError::UnknownIdentity(_)) => {}
            Err(RelayError::LookupFailure(e)) => return Err(e),
            Err(e) => warn!("Skipping user without usable key: {}", e),
        }
    }
    Ok(profiles)
}

// ============================================================================
// In-Memory Directory
// ============================================================================

/// In-memory user directory.
#[derive(Default)]
pub struct MemoryUserDirectory {
    inner: RwLock<MemoryUsers>,
}

#[derive(Default)]
struct MemoryUsers {
    by_id: HashMap<Uuid, UserRecord>,
    order: Vec<Uuid>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a user with a fixed identity.
    pub fn insert(&self, id: Uuid, username: &str) -> UserRecord {
        let record = UserRecord {
            id,
            username: username.to_string(),
            password_hash: String::new(),
            created_at: Utc::now(),
        };
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.by_id.insert(id, record.clone()).is_none() {
            inner.order.push(id);
        }
        record
    }
}

impl UserDirectory for MemoryUserDirectory {
    fn create_user(&self, username: &str, password_hash: &str) -> Result<UserRecord, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.by_id.values().any(|u| u.username == username) {
            return Err(StoreError::UsernameTaken(username.to_string()));
        }
        let record = UserRecord {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        inner.by_id.insert(record.id, record.clone());
        inner.order.push(record.id);
        Ok(record)
    }

    fn find_by_id(&self, id: &Uuid) -> Result<Option<UserRecord>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.by_id.get(id).cloned())
    }

    fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .by_id
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect())
    }
}

// ============================================================================
// SQLite Directory
// ============================================================================

/// SQLite-backed user directory.
pub struct SqliteUserDirectory {
    conn: Mutex<Connection>,
}

impl SqliteUserDirectory {
    /// Opens or creates a user database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(SqliteUserDirectory {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite user database.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }
}

type UserRow = (String, String, String, String);

fn user_from_row(row: UserRow) -> Result<UserRecord, StoreError> {
    let (id, username, password_hash, created_at) = row;
    Ok(UserRecord {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(format!("user id: {}", e)))?,
        username,
        password_hash,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt(format!("user created_at: {}", e)))?,
    })
}

fn read_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

impl UserDirectory for SqliteUserDirectory {
    fn create_user(&self, username: &str, password_hash: &str) -> Result<UserRecord, StoreError> {
        let record = UserRecord {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            // Stored with microsecond precision.
            created_at: Utc::now().trunc_subsecs(6),
        };
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (id, username, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id.to_string(),
                record.username,
                record.password_hash,
                record.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::UsernameTaken(username.to_string()));
        }
        Ok(record)
    }

    fn find_by_id(&self, id: &Uuid) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row(
            "SELECT id, username, password_hash, created_at FROM users WHERE id = ?1",
            params![id.to_string()],
            read_user_row,
        )
        .optional()?
        .map(user_from_row)
        .transpose()
    }

    fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row(
            "SELECT id, username, password_hash, created_at FROM users WHERE username = ?1",
            params![username],
            read_user_row,
        )
        .optional()?
        .map(user_from_row)
        .transpose()
    }

    fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT id, username, password_hash, created_at FROM users ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], read_user_row)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(user_from_row(row?)?);
        }
        Ok(users)
    }
}

/// Creates a user directory based on the backend type.
pub fn create_user_directory(
    backend: StorageBackend,
    data_dir: &Path,
) -> Result<Box<dyn UserDirectory>, StoreError> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryUserDirectory::new())),
        StorageBackend::Sqlite => {
            let _ = std::fs::create_dir_all(data_dir);
            Ok(Box::new(SqliteUserDirectory::open(data_dir.join("users.db"))?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_vault::TEST_KEY_BITS;

    fn test_directory_impl(directory: &dyn UserDirectory) {
        let alice = directory.create_user("alice", "hash-a").unwrap();
        let bob = directory.create_user("bob", "hash-b").unwrap();

        assert_eq!(directory.find_by_id(&alice.id).unwrap(), Some(alice.clone()));
        assert_eq!(
            directory.find_by_username("bob").unwrap().map(|u| u.id),
            Some(bob.id)
        );
        assert!(directory.find_by_id(&Uuid::new_v4()).unwrap().is_none());
        assert!(directory.find_by_username("carol").unwrap().is_none());

        let listed: Vec<String> = directory
            .list_users()
            .unwrap()
            .into_iter()
            .map(|u| u.username)
            .collect();
        assert_eq!(listed, vec!["alice", "bob"]);
    }

    fn test_duplicate_username_impl(directory: &dyn UserDirectory) {
        directory.create_user("alice", "h1").unwrap();
        assert!(matches!(
            directory.create_user("alice", "h2"),
            Err(StoreError::UsernameTaken(_))
        ));
        assert_eq!(directory.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_directory() {
        test_directory_impl(&MemoryUserDirectory::new());
    }

    #[test]
    fn test_memory_duplicate_username() {
        test_duplicate_username_impl(&MemoryUserDirectory::new());
    }

    #[test]
    fn test_sqlite_directory() {
        test_directory_impl(&SqliteUserDirectory::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_duplicate_username() {
        test_duplicate_username_impl(&SqliteUserDirectory::in_memory().unwrap());
    }

    #[test]
    fn test_display_name_placeholder() {
        let directory = MemoryUserDirectory::new();
        let known = Uuid::new_v4();
        directory.insert(known, "alice");

        assert_eq!(display_name(&directory, &known), "alice");
        assert_eq!(display_name(&directory, &Uuid::new_v4()), UNKNOWN_USERNAME);
    }

    #[test]
    fn test_register_then_login() {
        let directory = MemoryUserDirectory::new();
        let vault = KeyVault::in_memory(TEST_KEY_BITS);

        let registered = register_or_login(&directory, &vault, "alice", "s3cret").unwrap();
        assert_eq!(registered.username, "alice");
        assert!(!registered.public_key.is_empty());

        let again = register_or_login(&directory, &vault, "alice", "s3cret").unwrap();
        assert_eq!(again, registered);

        let stored = directory.find_by_id(&registered.id).unwrap().unwrap();
        assert_ne!(stored.password_hash, "s3cret");
        assert!(stored.password_hash.starts_with("$argon2"));
    }

    #[test]
    fn test_login_with_wrong_password() {
        let directory = MemoryUserDirectory::new();
        let vault = KeyVault::in_memory(TEST_KEY_BITS);
        register_or_login(&directory, &vault, "alice", "right").unwrap();

        assert!(matches!(
            register_or_login(&directory, &vault, "alice", "wrong"),
            Err(AccountError::WrongPassword)
        ));
    }

    #[test]
    fn test_register_requires_credentials() {
        let directory = MemoryUserDirectory::new();
        let vault = KeyVault::in_memory(TEST_KEY_BITS);

        assert!(matches!(
            register_or_login(&directory, &vault, "  ", "pw"),
            Err(AccountError::MissingCredentials)
        ));
        assert!(matches!(
            register_or_login(&directory, &vault, "alice", ""),
            Err(AccountError::MissingCredentials)
        ));
        assert!(directory.list_users().unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_directory_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let alice = {
            let directory = create_user_directory(StorageBackend::Sqlite, dir.path()).unwrap();
            directory.create_user("alice", "hash").unwrap()
        };

        let directory = create_user_directory(StorageBackend::Sqlite, dir.path()).unwrap();
        assert_eq!(directory.find_by_id(&alice.id).unwrap(), Some(alice));
        assert!(dir.path().join("users.db").exists());
    }

    #[test]
    fn test_list_profiles_skips_users_without_keys() {
        let directory = MemoryUserDirectory::new();
        let vault = KeyVault::in_memory(TEST_KEY_BITS);
        let alice = register_or_login(&directory, &vault, "alice", "pw").unwrap();
        directory.insert(Uuid::new_v4(), "keyless");

        let profiles = list_profiles(&directory, &vault).unwrap();
        assert_eq!(profiles, vec![alice]);
    }
}
