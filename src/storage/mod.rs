// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Blob Storage Module
//!
//! Byte-level persistence of blobs keyed by their content hash, plus the
//! metadata database that records what is stored and for how long.
//!
//! ## Backends
//!
//! - [`LocalStorage`]: one file per blob, named by its hash, in a directory
//! - [`S3Storage`]: one object per blob, keyed by its hash, in a bucket
//!
//! The backend is chosen at startup by [`create_storage`] from the
//! [`StorageConfig`] discriminator. Backends know nothing about rules,
//! expiration or discovery.
//!
//! ## Storage Layout (local)
//!
//! ```text
//! {DATA_DIR}/
//!   blobs/{sha256}     # Committed payloads
//!   staging/{uuid}     # In-flight uploads and fetches
//!   blobs.redb         # Metadata (blobs, accessed, tokens)
//! ```
//!
//! ## Important Notes
//!
//! - Payloads are only ever written from a fully staged, hash-verified file
//! - `put` is idempotent: a second put of the same hash never corrupts data
//! - The metadata record is written after the payload and removed after it

pub mod local;
pub mod metadata;
pub mod s3;

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use url::Url;

use crate::config::StorageConfig;
use crate::models::BlobHash;

pub use local::LocalStorage;
pub use metadata::{
    BlobCommit, ConsumedCredential, EvictionCandidate, MetadataError, MetadataResult, MetadataStore,
};
pub use s3::S3Storage;

/// Streamed blob body.
pub type BlobStream = BoxStream<'static, io::Result<Bytes>>;

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(BlobHash),

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("object store error: {0}")]
    ObjectStore(String),

    /// The backend cannot be reached or is misconfigured.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A payload present in the backend, as reported by [`BlobStorage::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub hash: BlobHash,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

// =============================================================================
// Storage Trait
// =============================================================================

/// Capability set every storage backend provides.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Verify the backend is usable. Idempotent. Failure at startup is
    /// fatal.
    async fn setup(&self) -> StorageResult<()>;

    /// Cheap read-only reachability check for health reporting.
    async fn check(&self) -> StorageResult<()> {
        self.has(&BlobHash::of(b"")).await.map(|_| ())
    }

    async fn has(&self, hash: &BlobHash) -> StorageResult<bool>;

    /// Stream a stored blob. Returns [`StorageError::NotFound`] if absent.
    async fn get(&self, hash: &BlobHash) -> StorageResult<BlobStream>;

    /// Commit a fully staged file under `hash`, consuming the staged file.
    ///
    /// The caller guarantees the file hashes to `hash`. Returns the committed
    /// size. Committing an already stored hash leaves the stored bytes as
    /// they are.
    async fn put(&self, hash: &BlobHash, staged: &Path) -> StorageResult<u64>;

    /// Delete a stored blob. Returns [`StorageError::NotFound`] if absent.
    async fn remove(&self, hash: &BlobHash) -> StorageResult<()>;

    /// Every payload currently held. Used by orphan reconciliation.
    async fn list(&self) -> StorageResult<Vec<StoredObject>>;

    /// Externally visible URL overriding the server's own, if the backend
    /// serves blobs publicly.
    fn public_url(&self, _hash: &BlobHash, _ext: Option<&str>) -> Option<Url> {
        None
    }
}

/// Build the backend selected by the configuration. Does not call `setup`.
pub async fn create_storage(config: &StorageConfig) -> Arc<dyn BlobStorage> {
    match config {
        StorageConfig::Local { dir } => Arc::new(LocalStorage::new(dir)),
        StorageConfig::S3(s3) => Arc::new(S3Storage::new(s3).await),
    }
}

/// Remove a blob, treating an already missing payload as success.
pub async fn remove_if_present(storage: &dyn BlobStorage, hash: &BlobHash) -> StorageResult<()> {
    match storage.remove(hash).await {
        Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
