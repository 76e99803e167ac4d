// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Staging area for bytes that are not yet committed to storage.
//!
//! Uploads and remote fetches stream into a uniquely named file under
//! `{DATA_DIR}/staging` while a [`ContentHasher`] computes the digest.
//! The file only reaches the storage backend once the digest is known.
//! A [`StagedFile`] removes its file when dropped, so every rejection path
//! cleans up without explicit calls.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::content_type::{sniff, SNIFF_LEN};
use crate::models::BlobHash;

// =============================================================================
// Hashing
// =============================================================================

/// Incremental SHA-256 with byte count and a short head for type sniffing.
#[derive(Default)]
pub struct ContentHasher {
    sha: Sha256,
    size: u64,
    head: Vec<u8>,
}

/// Result of hashing a complete stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub hash: BlobHash,
    pub size: u64,
    /// Type guessed from leading magic bytes.
    pub sniffed_type: Option<&'static str>,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.sha.update(chunk);
        self.size += chunk.len() as u64;
        if self.head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - self.head.len()).min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finish(self) -> ContentDigest {
        ContentDigest {
            hash: BlobHash::from_digest(&self.sha.finalize()),
            size: self.size,
            sniffed_type: sniff(&self.head),
        }
    }
}

// =============================================================================
// Staged File Guard
// =============================================================================

/// A file in the staging area. Deleted on drop unless already consumed.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file now instead of at drop.
    pub async fn discard(self) {
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove staged file");
            }
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        // Backends consume the file on commit, so NotFound is the common case.
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed staged file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove staged file"),
        }
    }
}

// =============================================================================
// Staging Area
// =============================================================================

#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the directory and clear leftovers from a previous run.
    pub async fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let mut entries = fs::read_dir(&self.dir).await?;
        let mut cleared = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() && fs::remove_file(entry.path()).await.is_ok() {
                cleared += 1;
            }
        }
        if cleared > 0 {
            debug!(cleared, "Cleared stale staging files");
        }
        Ok(())
    }

    /// Open a new uniquely named staging file for writing.
    pub async fn create(&self) -> io::Result<StagingWriter> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(Uuid::new_v4().to_string());
        let file = File::create(&path).await?;
        Ok(StagingWriter {
            writer: BufWriter::new(file),
            staged: StagedFile { path },
        })
    }
}

/// Open staging file. Dropping it without [`finish`](Self::finish) removes
/// the partial file.
pub struct StagingWriter {
    writer: BufWriter<File>,
    staged: StagedFile,
}

impl StagingWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.writer.write_all(chunk).await
    }

    /// Flush and sync, handing back the guard for the complete file.
    pub async fn finish(mut self) -> io::Result<StagedFile> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        Ok(self.staged)
    }
}
