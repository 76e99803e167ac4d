// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Blob Resolution
//!
//! Finds the bytes for a hash by trying an ordered list of sources and
//! stopping at the first hit:
//!
//! 1. [`Source::Local`]: the storage backend
//! 2. [`Source::Discovery`]: locations announced on the discovery network
//! 3. [`Source::Upstream`]: configured upstream hosts
//!
//! ## Fetch-through caching
//!
//! A remote hit is served through a detached [`CacheFill`] task that owns
//! the remote stream. It hashes every chunk, writes it to staging and
//! forwards it to the client. The last chunk is held back until the digest
//! is known: on a match the blob is committed and the chunk released, on a
//! mismatch the client stream ends with an error and nothing is cached.
//! The fill keeps going if the client disconnects. At most one fill per
//! hash writes to staging at a time, through the shared [`HashClaims`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::claims::{HashClaim, HashClaims};
use crate::content_type::{mime_for_extension, OCTET_STREAM};
use crate::discovery::{BlobSearch, DiscoveryNetwork, Pointer, UpstreamHosts};
use crate::models::{BlobHash, BlobRecord};
use crate::rules::RuleEngine;
use crate::staging::{ContentHasher, StagingArea, StagingWriter};
use crate::storage::{BlobStorage, BlobStream, MetadataStore, StorageError};
use crate::transport::HttpTransport;

/// Chunks buffered between a fill task and its client.
const FILL_CHANNEL_CAPACITY: usize = 16;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Local,
    Discovery,
    Upstream,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Source::Local => "local",
            Source::Discovery => "discovery",
            Source::Upstream => "upstream",
        })
    }
}

/// A blob ready to be streamed to the client.
pub struct ResolvedBlob {
    pub hash: BlobHash,
    pub source: Source,
    /// Response content type.
    pub mime_type: String,
    /// Known length, only for local hits.
    pub size: Option<u64>,
    pub body: BlobStream,
}

impl std::fmt::Debug for ResolvedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedBlob")
            .field("hash", &self.hash)
            .field("source", &self.source)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Outcome of asking one source.
#[derive(Debug)]
pub enum Attempt {
    Found(ResolvedBlob),
    Miss,
    /// The source had candidates but none could be fetched.
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("blob not found: {0}")]
    NotFound(BlobHash),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),
}

/// Content type for a response: requested extension first, then what the
/// source knows, then a generic default.
pub fn response_mime(ext: Option<&str>, known: Option<&str>) -> String {
    ext.and_then(mime_for_extension)
        .or(known)
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

// =============================================================================
// Cache Fill
// =============================================================================

/// Where a verified fill is committed.
struct FillTarget {
    writer: StagingWriter,
    _claim: HashClaim,
    storage: Arc<dyn BlobStorage>,
    metadata: Arc<MetadataStore>,
    rules: Arc<RuleEngine>,
    mime_type: Option<String>,
}

/// Detached task tee-ing a remote stream into staging and a client channel.
struct CacheFill {
    hash: BlobHash,
    remote: BlobStream,
    client: mpsc::Sender<io::Result<Bytes>>,
    target: Option<FillTarget>,
    idle_timeout: Duration,
}

impl CacheFill {
    async fn run(mut self) {
        let mut hasher = ContentHasher::new();
        let mut held: Option<Bytes> = None;
        let mut client_open = true;

        loop {
            let next = tokio::time::timeout(self.idle_timeout, self.remote.next()).await;
            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => break,
                Ok(Some(Err(e))) => return self.abort(client_open, e).await,
                Err(_) => {
                    let e = io::Error::new(io::ErrorKind::TimedOut, "remote stream stalled");
                    return self.abort(client_open, e).await;
                }
            };

            hasher.update(&chunk);
            if let Some(target) = self.target.as_mut() {
                if let Err(e) = target.writer.write(&chunk).await {
                    warn!(hash = %self.hash, error = %e, "Staging write failed, serving without caching");
                    self.target = None;
                }
            }

            if let Some(previous) = held.replace(chunk) {
                if client_open && self.client.send(Ok(previous)).await.is_err() {
                    client_open = false;
                    if self.target.is_none() {
                        debug!(hash = %self.hash, "Client gone and not caching, stopping fill");
                        return;
                    }
                }
            }
        }

        let digest = hasher.finish();
        if digest.hash != self.hash {
            warn!(expected = %self.hash, actual = %digest.hash, "Remote payload failed integrity check");
            if client_open {
                let e = io::Error::new(io::ErrorKind::InvalidData, "integrity mismatch");
                self.client.send(Err(e)).await.ok();
            }
            return;
        }

        if let Some(target) = self.target.take() {
            commit_fill(&self.hash, digest.size, target).await;
        }

        if let Some(last) = held {
            if client_open {
                self.client.send(Ok(last)).await.ok();
            }
        }
    }

    async fn abort(self, client_open: bool, e: io::Error) {
        warn!(hash = %self.hash, error = %e, "Remote stream failed");
        if client_open {
            self.client.send(Err(e)).await.ok();
        }
    }
}

async fn commit_fill(hash: &BlobHash, size: u64, target: FillTarget) {
    let staged = match target.writer.finish().await {
        Ok(staged) => staged,
        Err(e) => {
            warn!(hash = %hash, error = %e, "Failed to finish staged fill");
            return;
        }
    };

    if let Err(e) = target.storage.put(hash, staged.path()).await {
        warn!(hash = %hash, error = %e, "Failed to cache fetched blob");
        return;
    }

    let now = Utc::now();
    let expiration = target.rules.retention_for(target.mime_type.as_deref(), now);
    let record = BlobRecord::new(hash.clone(), size, target.mime_type, now.timestamp())
        .with_expiration(expiration);

    match target.metadata.commit_blob(record) {
        Ok(_) => info!(hash = %hash, size, ?expiration, "Cached fetched blob"),
        Err(e) => warn!(hash = %hash, error = %e, "Failed to record fetched blob"),
    }
}

fn channel_stream(rx: mpsc::Receiver<io::Result<Bytes>>) -> BlobStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

// =============================================================================
// Resolver
// =============================================================================

pub struct Resolver {
    storage: Arc<dyn BlobStorage>,
    metadata: Arc<MetadataStore>,
    rules: Arc<RuleEngine>,
    staging: StagingArea,
    transport: HttpTransport,
    discovery: Option<Arc<dyn DiscoveryNetwork>>,
    upstream: UpstreamHosts,
    claims: HashClaims,
}

impl Resolver {
    pub fn new(
        storage: Arc<dyn BlobStorage>,
        metadata: Arc<MetadataStore>,
        rules: Arc<RuleEngine>,
        staging: StagingArea,
        transport: HttpTransport,
        claims: HashClaims,
    ) -> Self {
        Self {
            storage,
            metadata,
            rules,
            staging,
            transport,
            discovery: None,
            upstream: UpstreamHosts::default(),
            claims,
        }
    }

    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryNetwork>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    #[must_use]
    pub fn with_upstream(mut self, upstream: UpstreamHosts) -> Self {
        self.upstream = upstream;
        self
    }

    /// Enabled sources in the order they are tried.
    pub fn sources(&self) -> Vec<Source> {
        let mut sources = vec![Source::Local];
        if self.discovery.is_some() {
            sources.push(Source::Discovery);
        }
        if !self.upstream.is_empty() {
            sources.push(Source::Upstream);
        }
        sources
    }

    pub async fn resolve(&self, search: &BlobSearch) -> Result<ResolvedBlob, ResolveError> {
        for source in self.sources() {
            match self.attempt(source, search).await? {
                Attempt::Found(blob) => {
                    debug!(hash = %search.hash, %source, "Blob resolved");
                    return Ok(blob);
                }
                Attempt::Miss => debug!(hash = %search.hash, %source, "Source miss"),
                Attempt::Failed(reason) => {
                    warn!(hash = %search.hash, %source, %reason, "Source failed");
                }
            }
        }
        Err(ResolveError::NotFound(search.hash.clone()))
    }

    pub async fn attempt(&self, source: Source, search: &BlobSearch) -> Result<Attempt, ResolveError> {
        match source {
            Source::Local => self.attempt_local(search).await,
            Source::Discovery => {
                let pointers = match &self.discovery {
                    Some(discovery) => discovery.search(search).await,
                    None => Vec::new(),
                };
                Ok(self.attempt_pointers(Source::Discovery, pointers, search).await)
            }
            Source::Upstream => {
                let pointers = self.upstream.pointers(search);
                Ok(self.attempt_pointers(Source::Upstream, pointers, search).await)
            }
        }
    }

    async fn attempt_local(&self, search: &BlobSearch) -> Result<Attempt, ResolveError> {
        if !self.storage.has(&search.hash).await? {
            return Ok(Attempt::Miss);
        }

        let body = match self.storage.get(&search.hash).await {
            Ok(body) => body,
            // Removed between `has` and `get`.
            Err(StorageError::NotFound(_)) => return Ok(Attempt::Miss),
            Err(e) => return Err(e.into()),
        };

        let record = self.metadata.get_blob(&search.hash).unwrap_or_else(|e| {
            warn!(hash = %search.hash, error = %e, "Failed to read blob record");
            None
        });
        if let Err(e) = self.metadata.touch_access(&search.hash, Utc::now().timestamp()) {
            warn!(hash = %search.hash, error = %e, "Failed to update access time");
        }

        Ok(Attempt::Found(ResolvedBlob {
            hash: search.hash.clone(),
            source: Source::Local,
            mime_type: response_mime(
                search.ext.as_deref(),
                record.as_ref().and_then(|r| r.mime_type.as_deref()),
            ),
            size: record.map(|r| r.size),
            body,
        }))
    }

    async fn attempt_pointers(&self, source: Source, pointers: Vec<Pointer>, search: &BlobSearch) -> Attempt {
        if pointers.is_empty() {
            return Attempt::Miss;
        }

        let mut failures = Vec::new();
        for pointer in pointers {
            match self.fetch_through(source, &pointer, search).await {
                Ok(blob) => return Attempt::Found(blob),
                Err(reason) => {
                    debug!(hash = %search.hash, location = %pointer.location, %reason, "Pointer failed");
                    failures.push(format!("{}: {reason}", pointer.location));
                }
            }
        }
        Attempt::Failed(failures.join("; "))
    }

    /// Open `pointer` and hand its stream to a cache fill task.
    async fn fetch_through(
        &self,
        source: Source,
        pointer: &Pointer,
        search: &BlobSearch,
    ) -> Result<ResolvedBlob, String> {
        let remote = self
            .transport
            .fetch(&pointer.location)
            .await
            .map_err(|e| e.to_string())?;

        let content_length = remote.content_length;
        let stored_mime = pointer
            .mime_type
            .clone()
            .or_else(|| search.ext.as_deref().and_then(mime_for_extension).map(str::to_string))
            .or(remote.mime_type);

        let target = match self.claims.try_claim(&search.hash) {
            Some(claim) => match self.staging.create().await {
                Ok(writer) => Some(FillTarget {
                    writer,
                    _claim: claim,
                    storage: self.storage.clone(),
                    metadata: self.metadata.clone(),
                    rules: self.rules.clone(),
                    mime_type: stored_mime.clone(),
                }),
                Err(e) => {
                    warn!(hash = %search.hash, error = %e, "Cannot stage fetched blob, serving without caching");
                    None
                }
            },
            None => {
                debug!(hash = %search.hash, "Hash is claimed elsewhere, serving without caching");
                None
            }
        };

        let (tx, rx) = mpsc::channel(FILL_CHANNEL_CAPACITY);
        let fill = CacheFill {
            hash: search.hash.clone(),
            remote: remote.stream,
            client: tx,
            target,
            idle_timeout: self.transport.timeout(),
        };
        tokio::spawn(fill.run());

        info!(hash = %search.hash, %source, location = %pointer.location, "Serving remote blob");
        Ok(ResolvedBlob {
            hash: search.hash.clone(),
            source,
            mime_type: response_mime(search.ext.as_deref(), stored_mime.as_deref()),
            size: content_length,
            body: channel_stream(rx),
        })
    }
}
