// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded blob metadata database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `blobs`: sha256 → serialized [`BlobRecord`]
//! - `accessed`: sha256 → last successful read (unix seconds)
//! - `tokens`: credential id → serialized [`ConsumedCredential`]
//!
//! redb allows a single write transaction at a time, so every
//! read-modify-write below (insert-if-absent, merge, consume) is atomic with
//! respect to concurrent requests.

use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::models::{BlobHash, BlobRecord};

// =============================================================================
// Table Definitions
// =============================================================================

const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

const ACCESSED: TableDefinition<&str, i64> = TableDefinition::new("accessed");

/// Consumed credential ids, kept until the credential itself expires.
const TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("tokens");

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

// =============================================================================
// Stored Types
// =============================================================================

/// Replay-protection entry for a credential that authorized an upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsumedCredential {
    #[serde(rename = "type")]
    pub kind: u32,
    pub pubkey: String,
    /// When the credential stops being valid; the entry can be dropped then.
    pub expiration: Option<i64>,
    pub consumed_at: i64,
}

/// Outcome of [`MetadataStore::commit_blob`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobCommit {
    /// No record existed; the given record was inserted.
    Created(BlobRecord),
    /// A record already existed; it was merged with the new one.
    Existing(BlobRecord),
}

impl BlobCommit {
    pub fn into_record(self) -> BlobRecord {
        match self {
            BlobCommit::Created(record) | BlobCommit::Existing(record) => record,
        }
    }
}

/// A record considered for capacity eviction, with its last read time.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub record: BlobRecord,
    /// Last access, or creation time if never read.
    pub last_used: i64,
}

/// Apply expiration extension and subject key union. Returns `true` if the
/// record changed.
fn merge_into(
    record: &mut BlobRecord,
    expiration: Option<i64>,
    subject_keys: &[String],
    now: i64,
) -> bool {
    let mut changed = record.extend_expiration(expiration);
    for key in subject_keys {
        changed |= record.add_subject_key(key);
    }
    if changed {
        record.updated = now;
    }
    changed
}

// =============================================================================
// MetadataStore
// =============================================================================

pub struct MetadataStore {
    db: Database,
}

impl MetadataStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> MetadataResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(BLOBS)?;
            let _ = write_txn.open_table(ACCESSED)?;
            let _ = write_txn.open_table(TOKENS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    // =========================================================================
    // Blob records
    // =========================================================================

    pub fn get_blob(&self, hash: &BlobHash) -> MetadataResult<Option<BlobRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BLOBS)?;
        match table.get(hash.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// One read transaction over the blob table; used for health reporting.
    pub fn check(&self) -> MetadataResult<()> {
        let read_txn = self.db.begin_read()?;
        read_txn.open_table(BLOBS)?;
        Ok(())
    }

    pub fn has_blob(&self, hash: &BlobHash) -> MetadataResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BLOBS)?;
        Ok(table.get(hash.as_str())?.is_some())
    }

    /// Insert `record` unless one exists for its hash; otherwise merge the
    /// new expiration and subject keys into the stored record.
    pub fn commit_blob(&self, record: BlobRecord) -> MetadataResult<BlobCommit> {
        let now = record.updated;
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(BLOBS)?;

            let existing_bytes = table.get(record.hash.as_str())?.map(|v| v.value().to_vec());

            match existing_bytes {
                Some(bytes) => {
                    let mut existing: BlobRecord = serde_json::from_slice(&bytes)?;
                    if merge_into(&mut existing, record.expiration, &record.subject_keys, now) {
                        let json = serde_json::to_vec(&existing)?;
                        table.insert(existing.hash.as_str(), json.as_slice())?;
                    }
                    BlobCommit::Existing(existing)
                }
                None => {
                    let json = serde_json::to_vec(&record)?;
                    table.insert(record.hash.as_str(), json.as_slice())?;
                    BlobCommit::Created(record)
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Extend an existing record's expiration and add a subject key.
    /// Returns `None` if no record exists.
    pub fn merge_blob(
        &self,
        hash: &BlobHash,
        expiration: Option<i64>,
        subject_key: Option<&str>,
        now: i64,
    ) -> MetadataResult<Option<BlobRecord>> {
        let keys: Vec<String> = subject_key.map(str::to_string).into_iter().collect();

        let write_txn = self.db.begin_write()?;
        let merged = {
            let mut table = write_txn.open_table(BLOBS)?;
            let existing_bytes = table.get(hash.as_str())?.map(|v| v.value().to_vec());

            match existing_bytes {
                Some(bytes) => {
                    let mut record: BlobRecord = serde_json::from_slice(&bytes)?;
                    if merge_into(&mut record, expiration, &keys, now) {
                        let json = serde_json::to_vec(&record)?;
                        table.insert(hash.as_str(), json.as_slice())?;
                    }
                    Some(record)
                }
                None => None,
            }
        };
        write_txn.commit()?;
        Ok(merged)
    }

    /// All records, newest first, optionally restricted to one subject key.
    pub fn list_blobs(&self, subject_key: Option<&str>) -> MetadataResult<Vec<BlobRecord>> {
        let mut records = self.scan(|record| subject_key.is_none_or(|key| record.has_subject_key(key)))?;
        records.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.hash.cmp(&b.hash)));
        Ok(records)
    }

    /// Records whose expiration is at or before `now`.
    pub fn expired_blobs(&self, now: i64) -> MetadataResult<Vec<BlobRecord>> {
        self.scan(|record| record.is_expired(now))
    }

    fn scan(&self, mut keep: impl FnMut(&BlobRecord) -> bool) -> MetadataResult<Vec<BlobRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BLOBS)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: BlobRecord = serde_json::from_slice(value.value())?;
            if keep(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Delete a record and its access row. Returns `false` if absent.
    pub fn remove_blob(&self, hash: &BlobHash) -> MetadataResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut blobs = write_txn.open_table(BLOBS)?;
            let removed = blobs.remove(hash.as_str())?.is_some();
            let mut accessed = write_txn.open_table(ACCESSED)?;
            accessed.remove(hash.as_str())?;
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Sum of recorded blob sizes.
    pub fn total_size(&self) -> MetadataResult<u64> {
        Ok(self.scan(|_| true)?.iter().map(|r| r.size).sum())
    }

    // =========================================================================
    // Access times
    // =========================================================================

    pub fn touch_access(&self, hash: &BlobHash, now: i64) -> MetadataResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ACCESSED)?;
            table.insert(hash.as_str(), now)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn last_access(&self, hash: &BlobHash) -> MetadataResult<Option<i64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCESSED)?;
        Ok(table.get(hash.as_str())?.map(|v| v.value()))
    }

    /// Every record ordered least recently used first.
    pub fn eviction_candidates(&self) -> MetadataResult<Vec<EvictionCandidate>> {
        let read_txn = self.db.begin_read()?;
        let blobs = read_txn.open_table(BLOBS)?;
        let accessed = read_txn.open_table(ACCESSED)?;

        let mut candidates = Vec::new();
        for entry in blobs.iter()? {
            let (key, value) = entry?;
            let record: BlobRecord = serde_json::from_slice(value.value())?;
            let last_used = accessed
                .get(key.value())?
                .map(|v| v.value())
                .unwrap_or(record.created);
            candidates.push(EvictionCandidate { record, last_used });
        }
        candidates.sort_by(|a, b| {
            a.last_used
                .cmp(&b.last_used)
                .then_with(|| a.record.hash.cmp(&b.record.hash))
        });
        Ok(candidates)
    }

    // =========================================================================
    // Consumed credentials
    // =========================================================================

    pub fn is_credential_consumed(&self, id: &str) -> MetadataResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TOKENS)?;
        Ok(table.get(id)?.is_some())
    }

    /// Record a credential as used. Returns `false` if it already was.
    pub fn consume_credential(&self, id: &str, entry: &ConsumedCredential) -> MetadataResult<bool> {
        let json = serde_json::to_vec(entry)?;
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(TOKENS)?;
            if table.get(id)?.is_some() {
                false
            } else {
                table.insert(id, json.as_slice())?;
                true
            }
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    /// Forget a consumed credential so it can authorize again. Used when the
    /// upload it was burned for failed to commit.
    pub fn release_credential(&self, id: &str) -> MetadataResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(TOKENS)?;
            let removed = table.remove(id)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Drop consumed credentials whose own expiration has passed. Entries
    /// without an expiration are kept. Returns the number removed.
    pub fn prune_credentials(&self, now: i64) -> MetadataResult<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(TOKENS)?;

            let mut expired = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let consumed: ConsumedCredential = serde_json::from_slice(value.value())?;
                if consumed.expiration.is_some_and(|at| at <= now) {
                    expired.push(key.value().to_string());
                }
            }

            for id in &expired {
                table.remove(id.as_str())?;
            }
            expired.len()
        };
        write_txn.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataStore::open(&dir.path().join("test.redb")).unwrap();
        (dir, db)
    }

    fn record(data: &[u8], created: i64, expiration: Option<i64>, key: Option<&str>) -> BlobRecord {
        let mut record = BlobRecord::new(
            BlobHash::of(data),
            data.len() as u64,
            Some("text/plain".into()),
            created,
        )
        .with_expiration(expiration);
        if let Some(key) = key {
            record.add_subject_key(key);
        }
        record
    }

    fn consumed(expiration: Option<i64>) -> ConsumedCredential {
        ConsumedCredential {
            kind: 24242,
            pubkey: "alice".into(),
            expiration,
            consumed_at: 100,
        }
    }

    #[test]
    fn commit_inserts_then_merges() {
        let (_dir, db) = temp_db();

        let first = record(b"payload", 100, Some(1_000), Some("alice"));
        let hash = first.hash.clone();
        assert!(matches!(db.commit_blob(first).unwrap(), BlobCommit::Created(_)));

        let mut second = record(b"payload", 200, Some(5_000), Some("bob"));
        second.updated = 200;
        let merged = match db.commit_blob(second).unwrap() {
            BlobCommit::Existing(r) => r,
            other => panic!("expected existing, got {other:?}"),
        };
        assert_eq!(merged.created, 100);
        assert_eq!(merged.expiration, Some(5_000));
        assert_eq!(merged.subject_keys, vec!["alice", "bob"]);
        assert_eq!(merged.updated, 200);

        assert_eq!(db.get_blob(&hash).unwrap().unwrap(), merged);
    }

    #[test]
    fn merge_never_shortens_expiration() {
        let (_dir, db) = temp_db();
        let rec = record(b"x", 100, Some(1_000), None);
        let hash = rec.hash.clone();
        db.commit_blob(rec).unwrap();

        let merged = db.merge_blob(&hash, Some(500), Some("carol"), 150).unwrap().unwrap();
        assert_eq!(merged.expiration, Some(1_000));
        assert!(merged.has_subject_key("carol"));

        let forever = db.merge_blob(&hash, None, None, 160).unwrap().unwrap();
        assert_eq!(forever.expiration, None);

        assert!(db
            .merge_blob(&BlobHash::of(b"missing"), None, None, 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn list_filters_by_subject_key() {
        let (_dir, db) = temp_db();
        db.commit_blob(record(b"a", 100, None, Some("alice"))).unwrap();
        db.commit_blob(record(b"b", 200, None, Some("bob"))).unwrap();
        db.commit_blob(record(b"c", 300, None, Some("alice"))).unwrap();

        let all = db.list_blobs(None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].created, 300, "newest first");

        let alice = db.list_blobs(Some("alice")).unwrap();
        assert_eq!(alice.len(), 2);
        assert!(db.list_blobs(Some("mallory")).unwrap().is_empty());
    }

    #[test]
    fn expired_blobs_and_removal() {
        let (_dir, db) = temp_db();
        let old = record(b"old", 100, Some(1_000), None);
        let forever = record(b"forever", 100, None, None);
        let old_hash = old.hash.clone();
        db.commit_blob(old).unwrap();
        db.commit_blob(forever).unwrap();
        db.touch_access(&old_hash, 900).unwrap();

        assert!(db.expired_blobs(999).unwrap().is_empty());
        let expired = db.expired_blobs(1_000).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].hash, old_hash);

        assert!(db.remove_blob(&old_hash).unwrap());
        assert!(!db.remove_blob(&old_hash).unwrap());
        assert!(!db.has_blob(&old_hash).unwrap());
        assert_eq!(db.last_access(&old_hash).unwrap(), None);
    }

    #[test]
    fn eviction_order_prefers_least_recently_used() {
        let (_dir, db) = temp_db();
        let a = record(b"a", 100, None, None);
        let b = record(b"bb", 200, None, None);
        let (a_hash, b_hash) = (a.hash.clone(), b.hash.clone());
        db.commit_blob(a).unwrap();
        db.commit_blob(b).unwrap();

        // `a` was read recently, `b` never.
        db.touch_access(&a_hash, 500).unwrap();

        let order: Vec<_> = db
            .eviction_candidates()
            .unwrap()
            .into_iter()
            .map(|c| c.record.hash)
            .collect();
        assert_eq!(order, vec![b_hash, a_hash]);
        assert_eq!(db.total_size().unwrap(), 3);
    }

    #[test]
    fn credentials_are_consumed_once() {
        let (_dir, db) = temp_db();
        assert!(!db.is_credential_consumed("evt1").unwrap());
        assert!(db.consume_credential("evt1", &consumed(Some(1_000))).unwrap());
        assert!(!db.consume_credential("evt1", &consumed(Some(1_000))).unwrap());
        assert!(db.is_credential_consumed("evt1").unwrap());

        assert!(db.release_credential("evt1").unwrap());
        assert!(!db.release_credential("evt1").unwrap());
        assert!(db.consume_credential("evt1", &consumed(Some(1_000))).unwrap());
    }

    #[test]
    fn prune_credentials_drops_only_expired() {
        let (_dir, db) = temp_db();
        db.consume_credential("old", &consumed(Some(1_000))).unwrap();
        db.consume_credential("new", &consumed(Some(5_000))).unwrap();
        db.consume_credential("open", &consumed(None)).unwrap();

        assert_eq!(db.prune_credentials(2_000).unwrap(), 1);
        assert!(!db.is_credential_consumed("old").unwrap());
        assert!(db.is_credential_consumed("new").unwrap());
        assert!(db.is_credential_consumed("open").unwrap());
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        let rec = record(b"durable", 100, None, Some("alice"));
        let hash = rec.hash.clone();
        {
            let db = MetadataStore::open(&path).unwrap();
            db.commit_blob(rec).unwrap();
        }
        let db = MetadataStore::open(&path).unwrap();
        db.check().unwrap();
        assert!(db.get_blob(&hash).unwrap().unwrap().has_subject_key("alice"));
    }
}
