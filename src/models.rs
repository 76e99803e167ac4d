// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Blob Data Models
//!
//! Types shared by storage, metadata, the resolver and the HTTP boundary.
//!
//! ## Blob Hash Type
//!
//! The [`BlobHash`] newtype wraps a SHA-256 digest rendered as 64 lowercase
//! hexadecimal characters. It is the only key that correlates the storage
//! backend with the metadata store.
//!
//! ## Model Categories
//!
//! - **Records**: [`BlobRecord`], the persisted metadata of a stored blob
//! - **Descriptors**: [`BlobDescriptor`], the JSON shape returned to clients

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

// =============================================================================
// Blob Hash Type
// =============================================================================

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// SHA-256 content hash of a blob.
///
/// Always 64 lowercase hex characters; uppercase input is normalized.
///
/// # Example
///
/// ```rust,ignore
/// let hash: BlobHash = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9".parse()?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobHash(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid blob hash '{0}': expected 64 hex characters")]
pub struct InvalidHash(pub String);

impl BlobHash {
    /// Hash a complete payload. Streaming callers use [`crate::staging::ContentHasher`].
    pub fn of(data: &[u8]) -> Self {
        Self::from_digest(&Sha256::digest(data))
    }

    /// Wrap a raw 32-byte digest.
    pub fn from_digest(digest: &[u8]) -> Self {
        BlobHash(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for BlobHash {
    type Err = InvalidHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidHash(s.to_string()));
        }
        Ok(BlobHash(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for BlobHash {
    type Error = InvalidHash;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlobHash> for String {
    fn from(value: BlobHash) -> Self {
        value.0
    }
}

impl fmt::Display for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BlobHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Blob Record
// =============================================================================

/// Persisted metadata for a blob held by the storage backend.
///
/// Timestamps are unix seconds. `expiration: None` means the blob never
/// expires. `subject_keys` only ever grows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobRecord {
    pub hash: BlobHash,
    pub size: u64,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub created: i64,
    #[serde(default)]
    pub expiration: Option<i64>,
    #[serde(default)]
    pub subject_keys: Vec<String>,
    /// Last time the record was created or mutated.
    pub updated: i64,
}

impl BlobRecord {
    pub fn new(hash: BlobHash, size: u64, mime_type: Option<String>, now: i64) -> Self {
        Self {
            hash,
            size,
            mime_type,
            created: now,
            expiration: None,
            subject_keys: Vec::new(),
            updated: now,
        }
    }

    #[must_use]
    pub fn with_expiration(mut self, expiration: Option<i64>) -> Self {
        self.expiration = expiration;
        self
    }

    /// Expired once `now` reaches the expiration timestamp.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expiration, Some(at) if at <= now)
    }

    /// Returns `true` if the key was not yet associated.
    pub fn add_subject_key(&mut self, key: &str) -> bool {
        if self.subject_keys.iter().any(|k| k == key) {
            return false;
        }
        self.subject_keys.push(key.to_string());
        true
    }

    /// Move the expiration later, never earlier. `None` (never) wins over any
    /// timestamp. Returns `true` if the expiration changed.
    pub fn extend_expiration(&mut self, candidate: Option<i64>) -> bool {
        let extended = match (self.expiration, candidate) {
            (None, _) => None,
            (Some(_), None) => None,
            (Some(current), Some(next)) => Some(current.max(next)),
        };
        let changed = extended != self.expiration;
        self.expiration = extended;
        changed
    }

    pub fn has_subject_key(&self, key: &str) -> bool {
        self.subject_keys.iter().any(|k| k == key)
    }
}

// =============================================================================
// Blob Descriptor
// =============================================================================

/// Client-facing description of a stored blob.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct BlobDescriptor {
    /// Public URL the blob can be fetched from.
    pub url: String,
    /// Hex-encoded SHA-256 of the blob.
    pub sha256: String,
    /// Size in bytes.
    pub size: u64,
    /// MIME type, if known.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Creation time (unix seconds).
    pub created: i64,
}
