// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! SHA-256 Integrity Hashing
//!
//! Computes and verifies the digest clients attach to each chat message.
//! The digest covers the UTF-8 bytes of the **plaintext**, so it can only be
//! checked after the relay has decrypted the message.

use ring::digest;

/// Computes the SHA-256 digest of `plaintext` as a lowercase hex string.
pub fn digest(plaintext: &str) -> String {
    let hash = digest::digest(&digest::SHA256, plaintext.as_bytes());
    hex::encode(hash.as_ref())
}

/// Returns whether `claimed_hex` matches the digest of `plaintext`.
///
/// Plain string equality: an uppercase or truncated claim is a mismatch.
pub fn verify(plaintext: &str, claimed_hex: &str) -> bool {
    digest(plaintext) == claimed_hex
}
