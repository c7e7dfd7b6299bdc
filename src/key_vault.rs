// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Key Vault
//!
//! Generates, persists and uses the RSA key pair held for each user.
//!
//! Clients encrypt outgoing messages under their *own* public key with
//! RSA-OAEP(SHA-256); the relay decrypts with the matching private key before
//! delivery. Confidentiality therefore only extends as far as trust in the
//! relay: whoever operates it can read every message.
//!
//! Keys are persisted as hex-encoded DER (SPKI for public keys, PKCS#8 for
//! private keys). Parsed private keys are cached in memory after first use.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::Sha256;
use tracing::debug;
use uuid::Uuid;

use crate::error::{RelayError, StoreError};
use crate::message_store::StorageBackend;

/// Default RSA modulus size.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// An RSA key pair in DER form.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// SubjectPublicKeyInfo DER.
    pub public_key: Vec<u8>,
    /// PKCS#8 DER. Never leaves the vault or its key store.
    pub private_key: Vec<u8>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(&self.public_key))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Persistence for key pairs.
pub trait KeyStore: Send + Sync {
    /// Stores `pair` for `owner` unless one already exists, and returns the
    /// pair on file afterwards. The first stored pair always wins.
    fn insert_if_absent(&self, owner: Uuid, pair: &KeyPair) -> Result<KeyPair, StoreError>;

    /// Loads the pair for `owner`.
    fn get(&self, owner: &Uuid) -> Result<Option<KeyPair>, StoreError>;
}

// ============================================================================
// In-Memory Key Store
// ============================================================================

/// In-memory key store (keys are lost on restart).
#[derive(Default)]
pub struct MemoryKeyStore {
    pairs: RwLock<HashMap<Uuid, KeyPair>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn insert_if_absent(&self, owner: Uuid, pair: &KeyPair) -> Result<KeyPair, StoreError> {
        let mut pairs = self.pairs.write().unwrap_or_else(PoisonError::into_inner);
        Ok(pairs.entry(owner).or_insert_with(|| pair.clone()).clone())
    }

    fn get(&self, owner: &Uuid) -> Result<Option<KeyPair>, StoreError> {
        let pairs = self.pairs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(pairs.get(owner).cloned())
    }
}

// ============================================================================
// SQLite Key Store
// ============================================================================

/// SQLite-backed key store.
pub struct SqliteKeyStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyStore {
    /// Opens or creates a key database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS key_pairs (
                owner_id TEXT PRIMARY KEY,
                public_key TEXT NOT NULL,
                private_key TEXT NOT NULL
            )",
            [],
        )?;
        Ok(SqliteKeyStore {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite key database.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }
}

fn decode_pair(public_hex: String, private_hex: String) -> Result<KeyPair, StoreError> {
    let public_key =
        hex::decode(public_hex).map_err(|e| StoreError::Corrupt(format!("public key: {}", e)))?;
    let private_key = hex::decode(private_hex)
        .map_err(|e| StoreError::Corrupt(format!("private key: {}", e)))?;
    Ok(KeyPair {
        public_key,
        private_key,
    })
}

impl KeyStore for SqliteKeyStore {
    fn insert_if_absent(&self, owner: Uuid, pair: &KeyPair) -> Result<KeyPair, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT OR IGNORE INTO key_pairs (owner_id, public_key, private_key)
             VALUES (?1, ?2, ?3)",
            params![
                owner.to_string(),
                hex::encode(&pair.public_key),
                hex::encode(&pair.private_key)
            ],
        )?;
        let (public_hex, private_hex): (String, String) = conn.query_row(
            "SELECT public_key, private_key FROM key_pairs WHERE owner_id = ?1",
            params![owner.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        decode_pair(public_hex, private_hex)
    }

    fn get(&self, owner: &Uuid) -> Result<Option<KeyPair>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT public_key, private_key FROM key_pairs WHERE owner_id = ?1",
                params![owner.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(public_hex, private_hex)| decode_pair(public_hex, private_hex))
            .transpose()
    }
}

/// Creates a key store based on the backend type.
pub fn create_key_store(
    backend: StorageBackend,
    data_dir: &Path,
) -> Result<Box<dyn KeyStore>, StoreError> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryKeyStore::new())),
        StorageBackend::Sqlite => {
            let _ = std::fs::create_dir_all(data_dir);
            Ok(Box::new(SqliteKeyStore::open(data_dir.join("keys.db"))?))
        }
    }
}

// ============================================================================
// Vault
// ============================================================================

/// Per-user RSA key management and decryption.
pub struct KeyVault {
    store: Arc<dyn KeyStore>,
    /// Parsed private keys, published only after they are fully built.
    cache: RwLock<HashMap<Uuid, Arc<RsaPrivateKey>>>,
    key_bits: usize,
}

impl KeyVault {
    /// Creates a vault over the given key store.
    pub fn new(store: Arc<dyn KeyStore>, key_bits: usize) -> Self {
        KeyVault {
            store,
            cache: RwLock::new(HashMap::new()),
            key_bits,
        }
    }

    /// Creates a vault backed by a [`MemoryKeyStore`].
    pub fn in_memory(key_bits: usize) -> Self {
        Self::new(Arc::new(MemoryKeyStore::new()), key_bits)
    }

    /// Generates a fresh key pair from the OS random source.
    pub fn generate_key_pair(&self) -> Result<KeyPair, RelayError> {
        let private = RsaPrivateKey::new(&mut OsRng, self.key_bits)
            .map_err(|e| RelayError::CryptoFailure(format!("key generation: {}", e)))?;
        let public = RsaPublicKey::from(&private);

        let private_der = private
            .to_pkcs8_der()
            .map_err(|e| RelayError::CryptoFailure(format!("private key encoding: {}", e)))?;
        let public_der = public
            .to_public_key_der()
            .map_err(|e| RelayError::CryptoFailure(format!("public key encoding: {}", e)))?;

        Ok(KeyPair {
            public_key: public_der.as_bytes().to_vec(),
            private_key: private_der.as_bytes().to_vec(),
        })
    }

    /// Ensures `owner` has a key pair and returns its public key as hex.
    ///
    /// Generation happens before the store is touched; if two provisions race,
    /// the first stored pair is kept and both callers see it.
    pub fn provision(&self, owner: Uuid) -> Result<String, RelayError> {
        if let Some(existing) = self.store.get(&owner).map_err(RelayError::LookupFailure)? {
            return Ok(hex::encode(existing.public_key));
        }
        let fresh = self.generate_key_pair()?;
        let stored = self
            .store
            .insert_if_absent(owner, &fresh)
            .map_err(RelayError::PersistenceFailure)?;
        debug!("Provisioned key pair ({} bits)", self.key_bits);
        Ok(hex::encode(stored.public_key))
    }

    /// Returns the distributable public key of `owner` as hex-encoded DER.
    pub fn public_key_hex(&self, owner: &Uuid) -> Result<String, RelayError> {
        self.store
            .get(owner)
            .map_err(RelayError::LookupFailure)?
            .map(|pair| hex::encode(pair.public_key))
            .ok_or(RelayError::UnknownIdentity(*owner))
    }

    /// Decrypts an RSA-OAEP(SHA-256) ciphertext with `owner`'s private key.
    pub fn decrypt(&self, owner: &Uuid, ciphertext: &[u8]) -> Result<Vec<u8>, RelayError> {
        let key = self.private_key(owner)?;
        key.decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| RelayError::DecryptionFailure(e.to_string()))
    }

    fn private_key(&self, owner: &Uuid) -> Result<Arc<RsaPrivateKey>, RelayError> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(key) = cache.get(owner) {
                return Ok(key.clone());
            }
        }

        let pair = self
            .store
            .get(owner)
            .map_err(RelayError::LookupFailure)?
            .ok_or(RelayError::UnknownIdentity(*owner))?;
        let parsed = RsaPrivateKey::from_pkcs8_der(&pair.private_key)
            .map_err(|e| RelayError::CryptoFailure(format!("stored private key: {}", e)))?;

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.entry(*owner).or_insert_with(|| Arc::new(parsed)).clone())
    }
}

/// Small key size that keeps tests fast. Still leaves room for short
/// OAEP(SHA-256) messages (62 bytes).
#[cfg(test)]
pub(crate) const TEST_KEY_BITS: usize = 1024;

/// Client-side encryption used by tests: OAEP(SHA-256) under a hex SPKI key,
/// returned as base64.
#[cfg(test)]
pub(crate) fn encrypt_for_tests(public_key_hex: &str, plaintext: &str) -> String {
    use base64::Engine;
    use rsa::pkcs8::DecodePublicKey;

    let der = hex::decode(public_key_hex).unwrap();
    let public = RsaPublicKey::from_public_key_der(&der).unwrap();
    let ciphertext = public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext.as_bytes())
        .unwrap();
    base64::engine::general_purpose::STANDARD.encode(ciphertext)
}
