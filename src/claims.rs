// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-hash exclusive claims.
//!
//! Cache fills, uploads and the pruner all mutate the payload and record
//! of a hash. Each takes a claim on the hash first, so at most one of them
//! works on a given blob at a time:
//!
//! - fills use [`HashClaims::try_claim`] and stream without caching when busy
//! - the pruner uses [`HashClaims::try_claim`] and retries on a later sweep
//! - uploads use [`HashClaims::claim`] and wait their turn

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::models::BlobHash;

#[derive(Debug, Default)]
struct Inner {
    active: Mutex<HashSet<BlobHash>>,
    released: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct HashClaims {
    inner: Arc<Inner>,
}

impl HashClaims {
    /// Claim `hash` if nobody holds it.
    pub fn try_claim(&self, hash: &BlobHash) -> Option<HashClaim> {
        let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(hash.clone()) {
            return None;
        }
        Some(HashClaim {
            claims: self.clone(),
            hash: hash.clone(),
        })
    }

    /// Wait until `hash` is free, then claim it.
    pub async fn claim(&self, hash: &BlobHash) -> HashClaim {
        loop {
            // Registered before the check so a release in between is not missed.
            let released = self.inner.released.notified();
            if let Some(claim) = self.try_claim(hash) {
                return claim;
            }
            released.await;
        }
    }
}

/// Releases the hash on drop.
#[derive(Debug)]
pub struct HashClaim {
    claims: HashClaims,
    hash: BlobHash,
}

impl Drop for HashClaim {
    fn drop(&mut self) {
        self.claims
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.hash);
        self.claims.inner.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn one_holder_per_hash() {
        let claims = HashClaims::default();
        let hash = BlobHash::of(b"x");
        let other = BlobHash::of(b"y");

        let held = claims.try_claim(&hash).unwrap();
        assert!(claims.try_claim(&hash).is_none());
        assert!(claims.try_claim(&other).is_some());

        drop(held);
        assert!(claims.try_claim(&hash).is_some());
    }

    #[tokio::test]
    async fn waiter_gets_claim_after_release() {
        let claims = HashClaims::default();
        let hash = BlobHash::of(b"contended");
        let held = claims.try_claim(&hash).unwrap();

        let waiter = {
            let claims = claims.clone();
            let hash = hash.clone();
            tokio::spawn(async move {
                let _claim = claims.claim(&hash).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(claims.try_claim(&hash).is_some());
    }
}
