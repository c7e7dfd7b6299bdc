// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for relay integration tests.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use rand::rngs::OsRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use safechat_relay::connection_registry::ConnectionRegistry;
use safechat_relay::handler::ConnectionDeps;
use safechat_relay::integrity;
use safechat_relay::key_vault::KeyVault;
use safechat_relay::message_store::{MemoryMessageStore, MessageStore};
use safechat_relay::metrics::RelayMetrics;
use safechat_relay::rate_limit::RateLimiter;
use safechat_relay::relay::RelayEngine;
use safechat_relay::user_directory::MemoryUserDirectory;

/// Small keys keep provisioning fast; short messages still fit OAEP(SHA-256).
pub const TEST_KEY_BITS: usize = 1024;

pub const ALICE: &str = "11111111-1111-1111-1111-111111111111";
pub const BOB: &str = "22222222-2222-2222-2222-222222222222";

/// A fully wired in-memory relay.
#[allow(dead_code)]
pub struct TestRelay {
    pub engine: Arc<RelayEngine>,
    pub vault: Arc<KeyVault>,
    pub store: Arc<MemoryMessageStore>,
    pub directory: Arc<MemoryUserDirectory>,
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: RelayMetrics,
    pub rate_limiter: Arc<RateLimiter>,
}

#[allow(dead_code)]
impl TestRelay {
    pub fn new(rate_limit_per_min: u32) -> Self {
        let vault = Arc::new(KeyVault::in_memory(TEST_KEY_BITS));
        let store = Arc::new(MemoryMessageStore::new());
        let directory = Arc::new(MemoryUserDirectory::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = RelayMetrics::new();
        let engine = Arc::new(RelayEngine::new(
            vault.clone(),
            store.clone() as Arc<dyn MessageStore>,
            directory.clone(),
            registry.clone(),
            metrics.clone(),
        ));
        TestRelay {
            engine,
            vault,
            store,
            directory,
            registry,
            metrics,
            rate_limiter: Arc::new(RateLimiter::new(rate_limit_per_min)),
        }
    }

    /// Connection dependencies with a short idle timeout.
    pub fn deps(&self) -> ConnectionDeps {
        ConnectionDeps {
            engine: self.engine.clone(),
            rate_limiter: self.rate_limiter.clone(),
            metrics: self.metrics.clone(),
            max_message_size: 16 * 1024,
            idle_timeout: Duration::from_secs(5),
        }
    }

    /// Registers a user with a key pair and returns the public key as hex.
    pub fn add_user(&self, id: &str, username: &str) -> String {
        let id: Uuid = id.parse().unwrap();
        self.directory.insert(id, username);
        self.vault.provision(id).unwrap()
    }

    /// Waits until `id` holds a live registry entry.
    pub async fn wait_connected(&self, id: &str) {
        let id: Uuid = id.parse().unwrap();
        for _ in 0..100 {
            if self.registry.is_connected(&id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("user never became connected");
    }

    /// Waits until `id` no longer holds a registry entry.
    pub async fn wait_disconnected(&self, id: &str) {
        let id: Uuid = id.parse().unwrap();
        for _ in 0..100 {
            if !self.registry.is_connected(&id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("user never disconnected");
    }
}

/// Client-side encryption: OAEP(SHA-256) under a hex SPKI key, as base64.
#[allow(dead_code)]
pub fn encrypt_for(public_key_hex: &str, plaintext: &str) -> String {
    let der = hex::decode(public_key_hex).unwrap();
    let public = RsaPublicKey::from_public_key_der(&der).unwrap();
    let ciphertext = public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext.as_bytes())
        .unwrap();
    base64::engine::general_purpose::STANDARD.encode(ciphertext)
}

/// Builds a CHAT_MESSAGE text frame.
#[allow(dead_code)]
pub fn chat_frame(ciphertext: &str, message_hash: &str, sender: &str, recipient: &str) -> String {
    json!({
        "type": "CHAT_MESSAGE",
        "payload": {
            "encrypted_content": ciphertext,
            "message_hash": message_hash,
            "sender_id": sender,
            "recipient_id": recipient,
        }
    })
    .to_string()
}

/// Encrypts `plaintext` under `public_key_hex` and frames it with a correct digest.
#[allow(dead_code)]
pub fn encrypted_chat_frame(public_key_hex: &str, plaintext: &str, sender: &str, recipient: &str) -> String {
    chat_frame(
        &encrypt_for(public_key_hex, plaintext),
        &integrity::digest(plaintext),
        sender,
        recipient,
    )
}
