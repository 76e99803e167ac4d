// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Blob Pruner
//!
//! Background task that reclaims storage.
//!
//! ## Strategy
//!
//! Every `interval` (default 30 s) the pruner:
//! 1. Removes blobs whose expiration has passed. The payload goes first,
//!    then the record, so a record never points at bytes that were kept.
//! 2. Drops consumed credentials whose own expiration has passed.
//! 3. If `max_storage_bytes` is set, evicts least recently read blobs until
//!    the total is back under the quota.
//! 4. On the first sweep and every `reconcile_every` sweeps after, deletes
//!    payloads that have no record and records whose payload is gone.
//!
//! Anything touched within the grace window is left alone. Each removal
//! also takes the hash claim first; a hash held by an upload or fill is
//! skipped and revisited on the next sweep. Failures on one blob are
//! logged and the sweep moves on.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::claims::{HashClaim, HashClaims};
use crate::config::PrunerConfig;
use crate::models::{BlobHash, BlobRecord};
use crate::storage::{remove_if_present, BlobStorage, MetadataStore};

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub expired: usize,
    pub credentials: usize,
    pub evicted: usize,
    pub orphaned_payloads: usize,
    pub dangling_records: usize,
    pub busy: usize,
    pub failures: usize,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        *self == PruneReport::default()
    }
}

pub struct Pruner {
    storage: Arc<dyn BlobStorage>,
    metadata: Arc<MetadataStore>,
    claims: HashClaims,
    config: PrunerConfig,
    sweeps: AtomicU64,
}

impl Pruner {
    pub fn new(
        storage: Arc<dyn BlobStorage>,
        metadata: Arc<MetadataStore>,
        claims: HashClaims,
        config: PrunerConfig,
    ) -> Self {
        Self {
            storage,
            metadata,
            claims,
            config,
            sweeps: AtomicU64::new(0),
        }
    }

    /// Run the pruning loop until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(pruner.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            grace_secs = self.config.grace.as_secs(),
            max_storage_bytes = ?self.config.max_storage_bytes,
            "Blob pruner starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Blob pruner shutting down");
                return;
            }

            let report = self.sweep(Utc::now().timestamp()).await;
            if !report.is_empty() {
                info!(?report, "Prune sweep finished");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Blob pruner shutting down");
                    return;
                }
            }
        }
    }

    fn grace_cutoff(&self, now: i64) -> i64 {
        now.saturating_sub(self.config.grace.as_secs() as i64)
    }

    /// Claim `hash` for removal, or count it as busy.
    fn claim(&self, hash: &BlobHash, report: &mut PruneReport) -> Option<HashClaim> {
        let claim = self.claims.try_claim(hash);
        if claim.is_none() {
            debug!(hash = %hash, "Pruner: blob in use, skipping until next sweep");
            report.busy += 1;
        }
        claim
    }

    /// Execute one sweep as of `now` (unix seconds).
    pub async fn sweep(&self, now: i64) -> PruneReport {
        let mut report = PruneReport::default();

        self.prune_expired(now, &mut report).await;

        match self.metadata.prune_credentials(now) {
            Ok(removed) => report.credentials = removed,
            Err(e) => {
                warn!(error = %e, "Pruner: failed to prune consumed credentials");
                report.failures += 1;
            }
        }

        if let Some(quota) = self.config.max_storage_bytes {
            self.evict_to_quota(quota, now, &mut report).await;
        }

        let sweep = self.sweeps.fetch_add(1, Ordering::Relaxed);
        if sweep % self.config.reconcile_every.max(1) == 0 {
            self.reconcile(now, &mut report).await;
        }

        report
    }

    async fn prune_expired(&self, now: i64, report: &mut PruneReport) {
        let expired = match self.metadata.expired_blobs(now) {
            Ok(expired) => expired,
            Err(e) => {
                warn!(error = %e, "Pruner: failed to list expired blobs");
                report.failures += 1;
                return;
            }
        };

        let cutoff = self.grace_cutoff(now);
        for record in expired {
            if record.updated > cutoff {
                debug!(hash = %record.hash, "Pruner: expired blob inside grace window, skipping");
                continue;
            }

            let Some(_claim) = self.claim(&record.hash, report) else {
                continue;
            };
            // An upload may have extended it since the scan.
            let still_expired = match self.metadata.get_blob(&record.hash) {
                Ok(Some(current)) => current.is_expired(now) && current.updated <= cutoff,
                Ok(None) => false,
                Err(e) => {
                    warn!(hash = %record.hash, error = %e, "Pruner: failed to re-read blob record");
                    report.failures += 1;
                    false
                }
            };
            if !still_expired {
                continue;
            }

            if self.remove_blob(&record, "expired").await {
                report.expired += 1;
            } else {
                report.failures += 1;
            }
        }
    }

    async fn evict_to_quota(&self, quota: u64, now: i64, report: &mut PruneReport) {
        let mut total = match self.metadata.total_size() {
            Ok(total) if total > quota => total,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "Pruner: failed to compute stored size");
                report.failures += 1;
                return;
            }
        };

        let candidates = match self.metadata.eviction_candidates() {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Pruner: failed to list eviction candidates");
                report.failures += 1;
                return;
            }
        };

        let cutoff = self.grace_cutoff(now);
        for candidate in candidates {
            if total <= quota {
                break;
            }
            if candidate.record.updated > cutoff || candidate.last_used > cutoff {
                continue;
            }
            let Some(_claim) = self.claim(&candidate.record.hash, report) else {
                continue;
            };
            // An upload may have merged into it before the claim was taken.
            match self.metadata.get_blob(&candidate.record.hash) {
                Ok(Some(current)) if current.updated <= cutoff => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!(hash = %candidate.record.hash, error = %e, "Pruner: failed to re-read blob record");
                    report.failures += 1;
                    continue;
                }
            }
            if self.remove_blob(&candidate.record, "evicted").await {
                total = total.saturating_sub(candidate.record.size);
                report.evicted += 1;
            } else {
                report.failures += 1;
            }
        }

        if total > quota {
            warn!(total, quota, "Pruner: storage still over quota after eviction");
        }
    }

    /// Remove the payload, then the record. Returns `false` on failure.
    async fn remove_blob(&self, record: &BlobRecord, reason: &'static str) -> bool {
        if let Err(e) = remove_if_present(self.storage.as_ref(), &record.hash).await {
            warn!(hash = %record.hash, error = %e, reason, "Pruner: failed to remove payload");
            return false;
        }
        match self.metadata.remove_blob(&record.hash) {
            Ok(_) => {
                info!(hash = %record.hash, size = record.size, reason, "Pruner: removed blob");
                true
            }
            Err(e) => {
                warn!(hash = %record.hash, error = %e, reason, "Pruner: failed to remove blob record");
                false
            }
        }
    }

    async fn reconcile(&self, now: i64, report: &mut PruneReport) {
        let objects = match self.storage.list().await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(error = %e, "Pruner: failed to list stored payloads");
                report.failures += 1;
                return;
            }
        };
        let records = match self.metadata.list_blobs(None) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Pruner: failed to list blob records");
                report.failures += 1;
                return;
            }
        };

        let cutoff = self.grace_cutoff(now);
        let recorded: HashSet<&BlobHash> = records.iter().map(|r| &r.hash).collect();
        let stored: HashSet<&BlobHash> = objects.iter().map(|o| &o.hash).collect();

        for object in &objects {
            if recorded.contains(&object.hash) {
                continue;
            }
            // Unknown age counts as recent.
            if !object.modified.is_some_and(|m| m.timestamp() <= cutoff) {
                continue;
            }
            let Some(_claim) = self.claim(&object.hash, report) else {
                continue;
            };
            // The record may have been committed since the listing.
            if self.metadata.has_blob(&object.hash).unwrap_or(true) {
                continue;
            }
            match remove_if_present(self.storage.as_ref(), &object.hash).await {
                Ok(()) => {
                    info!(hash = %object.hash, size = object.size, "Pruner: removed orphaned payload");
                    report.orphaned_payloads += 1;
                }
                Err(e) => {
                    warn!(hash = %object.hash, error = %e, "Pruner: failed to remove orphaned payload");
                    report.failures += 1;
                }
            }
        }

        for record in &records {
            if stored.contains(&record.hash) || record.updated > cutoff {
                continue;
            }
            let Some(_claim) = self.claim(&record.hash, report) else {
                continue;
            };
            match self.storage.has(&record.hash).await {
                Ok(false) => {}
                Ok(true) => continue,
                Err(e) => {
                    warn!(hash = %record.hash, error = %e, "Pruner: failed to check payload");
                    report.failures += 1;
                    continue;
                }
            }
            match self.metadata.remove_blob(&record.hash) {
                Ok(_) => {
                    info!(hash = %record.hash, "Pruner: dropped record without payload");
                    report.dangling_records += 1;
                }
                Err(e) => {
                    warn!(hash = %record.hash, error = %e, "Pruner: failed to drop dangling record");
                    report.failures += 1;
                }
            }
        }
    }
}
