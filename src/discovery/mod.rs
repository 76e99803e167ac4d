// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Remote Blob Discovery
//!
//! Sources that can name a location for a blob this server does not hold.
//!
//! - [`RelayDiscovery`]: asks Nostr relays for file metadata events
//!   (kind 1063) tagged with the hash and turns their `url` tags into
//!   [`Pointer`]s
//! - [`UpstreamHosts`]: configured blob servers, asked for `/{hash}` in order
//!
//! Discovery only produces candidate locations. Fetching and verifying
//! bytes is the resolver's job.

pub mod relay;
pub mod upstream;

use async_trait::async_trait;
use url::Url;

use crate::models::BlobHash;

pub use relay::RelayDiscovery;
pub use upstream::UpstreamHosts;

/// A blob request as seen by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobSearch {
    pub hash: BlobHash,
    /// Extension from the request path, without the dot.
    pub ext: Option<String>,
    /// Restrict discovery to events authored by this key.
    pub pubkey: Option<String>,
}

impl BlobSearch {
    pub fn new(hash: BlobHash) -> Self {
        Self {
            hash,
            ext: None,
            pubkey: None,
        }
    }
}

/// Candidate remote location for a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    pub location: Url,
    /// Type advertised by the source, if any.
    pub mime_type: Option<String>,
}

/// A network that can be searched for blob locations.
///
/// Implementations never fail: unreachable peers and malformed answers
/// yield fewer (or no) pointers.
#[async_trait]
pub trait DiscoveryNetwork: Send + Sync {
    async fn search(&self, search: &BlobSearch) -> Vec<Pointer>;
}

/// Keep the first occurrence of each location.
pub(crate) fn dedup_pointers(pointers: Vec<Pointer>) -> Vec<Pointer> {
    let mut seen = std::collections::HashSet::new();
    pointers
        .into_iter()
        .filter(|p| seen.insert(p.location.clone()))
        .collect()
}
