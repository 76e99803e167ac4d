// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Upload Pipeline
//!
//! Accepts a streamed upload and turns it into a stored, recorded blob.
//!
//! ## Order of checks
//!
//! 1. Uploads enabled
//! 2. Credential present (when required) and not expired
//! 3. Credential not already used
//! 4. A rule admits the declared type for the uploader
//! 5. Body streamed to staging while hashing; size limit enforced
//! 6. Declared size equals received size (when auth is required)
//! 7. Credential burned
//! 8. Under the hash claim: existing blob, extend expiration and add the
//!    uploader; new blob, move into storage and create the record. If this
//!    step fails the credential is released again.
//!
//! Everything before step 5 is decided without reading the body. Staged
//! bytes are removed on every rejection path.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::auth::AuthCredential;
use crate::claims::HashClaims;
use crate::config::UploadConfig;
use crate::content_type::essence;
use crate::models::{BlobHash, BlobRecord};
use crate::rules::{Candidate, NoMatchingRule, RuleEngine};
use crate::staging::{ContentHasher, StagedFile, StagingArea};
use crate::storage::{BlobStorage, ConsumedCredential, MetadataError, MetadataStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("uploads are disabled on this server")]
    UploadsDisabled,

    #[error("an authorization credential is required to upload")]
    AuthRequired,

    #[error("authorization credential has expired")]
    CredentialExpired,

    #[error("authorization credential has already been used")]
    CredentialReused,

    #[error(transparent)]
    NoMatchingRule(#[from] NoMatchingRule),

    #[error("upload exceeds the maximum size of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("declared size {declared:?} does not match received size {actual}")]
    SizeMismatch { declared: Option<u64>, actual: u64 },

    #[error("failed to read upload body: {0}")]
    Body(String),

    #[error("staging error: {0}")]
    Staging(std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

pub struct UploadPipeline {
    storage: Arc<dyn BlobStorage>,
    metadata: Arc<MetadataStore>,
    rules: Arc<RuleEngine>,
    staging: StagingArea,
    claims: HashClaims,
    config: UploadConfig,
}

impl UploadPipeline {
    pub fn new(
        storage: Arc<dyn BlobStorage>,
        metadata: Arc<MetadataStore>,
        rules: Arc<RuleEngine>,
        staging: StagingArea,
        claims: HashClaims,
        config: UploadConfig,
    ) -> Self {
        Self {
            storage,
            metadata,
            rules,
            staging,
            claims,
            config,
        }
    }

    /// Run an upload through every check and commit it.
    pub async fn accept<S, E>(
        &self,
        mut body: S,
        content_type: Option<&str>,
        credential: Option<&AuthCredential>,
    ) -> Result<BlobRecord, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let now = Utc::now();
        let timestamp = now.timestamp();

        if !self.config.enabled {
            return Err(UploadError::UploadsDisabled);
        }
        if self.config.require_auth && credential.is_none() {
            return Err(UploadError::AuthRequired);
        }
        if let Some(credential) = credential {
            if credential.is_expired(timestamp) {
                return Err(UploadError::CredentialExpired);
            }
            if self.metadata.is_credential_consumed(&credential.id)? {
                return Err(UploadError::CredentialReused);
            }
        }

        let declared_type = content_type
            .map(essence)
            .filter(|t| !t.is_empty() && t != "*/*");
        let pubkey = credential.map(|c| c.pubkey.as_str());
        let rule = self.rules.evaluate(Candidate {
            mime_type: declared_type.as_deref(),
            pubkey,
        })?;
        let expiration = RuleEngine::expiration_for(rule, now);
        debug!(rule = %rule.id, ?declared_type, ?expiration, "Upload admitted by rule");

        // Stream into staging.
        let mut writer = self.staging.create().await.map_err(UploadError::Staging)?;
        let mut hasher = ContentHasher::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| UploadError::Body(e.to_string()))?;
            hasher.update(&chunk);
            if let Some(limit) = self.config.max_size {
                if hasher.size() > limit {
                    return Err(UploadError::TooLarge { limit });
                }
            }
            writer.write(&chunk).await.map_err(UploadError::Staging)?;
        }
        let staged = writer.finish().await.map_err(UploadError::Staging)?;
        let digest = hasher.finish();

        if self.config.require_auth {
            let declared = credential.and_then(|c| c.size);
            if declared != Some(digest.size) {
                return Err(UploadError::SizeMismatch {
                    declared,
                    actual: digest.size,
                });
            }
        }

        if let Some(credential) = credential {
            let entry = ConsumedCredential {
                kind: credential.kind,
                pubkey: credential.pubkey.clone(),
                expiration: credential.expiration,
                consumed_at: timestamp,
            };
            if !self.metadata.consume_credential(&credential.id, &entry)? {
                return Err(UploadError::CredentialReused);
            }
        }

        let hash = digest.hash;
        let mime_type = declared_type.or_else(|| digest.sniffed_type.map(str::to_string));
        let _claim = self.claims.claim(&hash).await;
        let committed = self
            .commit(staged, &hash, mime_type, expiration, pubkey, timestamp)
            .await;

        if committed.is_err() {
            if let Some(credential) = credential {
                match self.metadata.release_credential(&credential.id) {
                    Ok(_) => debug!(id = %credential.id, "Released credential of failed upload"),
                    Err(e) => warn!(id = %credential.id, error = %e, "Failed to release credential"),
                }
            }
        }
        committed
    }

    /// Merge into an existing blob or move the staged file into storage.
    /// Caller holds the claim on `hash`.
    async fn commit(
        &self,
        staged: StagedFile,
        hash: &BlobHash,
        mime_type: Option<String>,
        expiration: Option<i64>,
        pubkey: Option<&str>,
        timestamp: i64,
    ) -> Result<BlobRecord, UploadError> {
        if self.storage.has(hash).await? {
            if let Some(record) = self.metadata.merge_blob(hash, expiration, pubkey, timestamp)? {
                staged.discard().await;
                info!(hash = %hash, size = record.size, "Upload matched existing blob");
                return Ok(record);
            }
        }

        let size = self.storage.put(hash, staged.path()).await?;
        let mut record = BlobRecord::new(hash.clone(), size, mime_type, timestamp).with_expiration(expiration);
        if let Some(pubkey) = pubkey {
            record.add_subject_key(pubkey);
        }

        let record = self.metadata.commit_blob(record)?.into_record();
        info!(
            hash = %hash,
            size,
            mime_type = ?record.mime_type,
            expiration = ?record.expiration,
            "Blob uploaded"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use crate::models::BlobHash;
    use futures_util::stream;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        storage: Arc<LocalStorage>,
        metadata: Arc<MetadataStore>,
        claims: HashClaims,
        pipeline: UploadPipeline,
    }

    fn fixture(rules_json: &str, config: UploadConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path().join("blobs")));
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("meta.redb")).unwrap());
        let rules = RuleEngine::new(serde_json::from_str(rules_json).unwrap(), config.require_pubkey_in_rule);
        let claims = HashClaims::default();
        let pipeline = UploadPipeline::new(
            storage.clone(),
            metadata.clone(),
            Arc::new(rules),
            StagingArea::new(dir.path().join("staging")),
            claims.clone(),
            config,
        );
        Fixture {
            dir,
            storage,
            metadata,
            claims,
            pipeline,
        }
    }

    fn open_config() -> UploadConfig {
        UploadConfig {
            enabled: true,
            require_auth: false,
            ..UploadConfig::default()
        }
    }

    fn auth_config() -> UploadConfig {
        UploadConfig {
            enabled: true,
            require_auth: true,
            ..UploadConfig::default()
        }
    }

    fn credential(id: &str, pubkey: &str, size: Option<u64>) -> AuthCredential {
        AuthCredential {
            id: id.into(),
            pubkey: pubkey.into(),
            kind: 24242,
            created_at: 0,
            size,
            expiration: None,
        }
    }

    fn body(data: &[u8]) -> impl Stream<Item = Result<Bytes, io::Error>> + Unpin {
        let chunks: Vec<_> = data
            .chunks(3)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks)
    }

    fn staging_is_empty(dir: &Path) -> bool {
        let staging: PathBuf = dir.join("staging");
        std::fs::read_dir(staging).map(|mut d| d.next().is_none()).unwrap_or(true)
    }

    const TEXT_RULE: &str = r#"[{"id":"text","type":"text/*","expiration":"24h"}]"#;
    const ANY_RULE: &str = r#"[{"id":"any","type":"*","expiration":"1 week"}]"#;

    #[tokio::test]
    async fn accepts_text_upload_with_rule_expiration() {
        let fx = fixture(TEXT_RULE, open_config());
        let payload = b"0123456789";

        let before = Utc::now().timestamp();
        let record = fx
            .pipeline
            .accept(body(payload), Some("text/plain"), None)
            .await
            .unwrap();

        assert_eq!(record.hash, BlobHash::of(payload));
        assert_eq!(record.size, 10);
        assert_eq!(record.mime_type.as_deref(), Some("text/plain"));
        let expiration = record.expiration.unwrap();
        assert!(expiration >= before + 86_400 && expiration <= Utc::now().timestamp() + 86_400);
        assert!(fx.storage.has(&record.hash).await.unwrap());
        assert!(staging_is_empty(fx.dir.path()));
    }

    #[tokio::test]
    async fn size_mismatch_rejects_and_cleans_up() {
        let fx = fixture(ANY_RULE, auth_config());
        let payload = vec![7u8; 80];
        let cred = credential("evt-d", "alice", Some(100));

        let err = fx
            .pipeline
            .accept(body(&payload), Some("application/octet-stream"), Some(&cred))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::SizeMismatch {
                declared: Some(100),
                actual: 80
            }
        ));
        assert!(fx.metadata.get_blob(&BlobHash::of(&payload)).unwrap().is_none());
        assert!(!fx.storage.has(&BlobHash::of(&payload)).await.unwrap());
        assert!(staging_is_empty(fx.dir.path()));
        assert!(!fx.metadata.is_credential_consumed("evt-d").unwrap());
    }

    #[tokio::test]
    async fn duplicate_upload_unions_subject_keys() {
        let fx = fixture(ANY_RULE, auth_config());
        let payload = b"shared payload";
        let size = Some(payload.len() as u64);

        let first = fx
            .pipeline
            .accept(body(payload), Some("text/plain"), Some(&credential("e1", "alice", size)))
            .await
            .unwrap();
        let second = fx
            .pipeline
            .accept(body(payload), Some("text/plain"), Some(&credential("e2", "bob", size)))
            .await
            .unwrap();

        assert_eq!(first.hash, second.hash);
        assert_eq!(second.subject_keys, vec!["alice", "bob"]);
        assert_eq!(fx.storage.list().await.unwrap().len(), 1);
        assert!(staging_is_empty(fx.dir.path()));
    }

    #[tokio::test]
    async fn credential_cannot_be_reused() {
        let fx = fixture(ANY_RULE, auth_config());
        let cred = credential("once", "alice", Some(3));

        fx.pipeline.accept(body(b"abc"), None, Some(&cred)).await.unwrap();
        let err = fx
            .pipeline
            .accept(body(b"xyz"), None, Some(&cred))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::CredentialReused));
        assert!(fx.metadata.get_blob(&BlobHash::of(b"xyz")).unwrap().is_none());
    }

    #[tokio::test]
    async fn rejections_before_reading_body() {
        let disabled = fixture(ANY_RULE, UploadConfig::default());
        assert!(matches!(
            disabled.pipeline.accept(body(b"x"), None, None).await,
            Err(UploadError::UploadsDisabled)
        ));

        let fx = fixture(TEXT_RULE, auth_config());
        assert!(matches!(
            fx.pipeline.accept(body(b"x"), Some("text/plain"), None).await,
            Err(UploadError::AuthRequired)
        ));

        let mut expired = credential("old", "alice", Some(1));
        expired.expiration = Some(1);
        assert!(matches!(
            fx.pipeline
                .accept(body(b"x"), Some("text/plain"), Some(&expired))
                .await,
            Err(UploadError::CredentialExpired)
        ));

        assert!(matches!(
            fx.pipeline
                .accept(body(b"x"), Some("image/png"), Some(&credential("e", "alice", Some(1))))
                .await,
            Err(UploadError::NoMatchingRule(_))
        ));
        assert!(staging_is_empty(fx.dir.path()));
    }

    #[tokio::test]
    async fn enforces_max_size() {
        let config = UploadConfig {
            max_size: Some(8),
            ..open_config()
        };
        let fx = fixture(ANY_RULE, config);
        assert!(matches!(
            fx.pipeline.accept(body(&[0u8; 32]), None, None).await,
            Err(UploadError::TooLarge { limit: 8 })
        ));
        assert!(staging_is_empty(fx.dir.path()));
    }

    #[tokio::test]
    async fn sniffs_type_when_none_declared() {
        let fx = fixture(ANY_RULE, open_config());
        let png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR-rest-of-image";
        let record = fx.pipeline.accept(body(png), None, None).await.unwrap();
        assert_eq!(record.mime_type.as_deref(), Some("image/png"));

        let declared = fx
            .pipeline
            .accept(body(b"\x89PNG\r\n\x1a\nsecond"), Some("application/x-custom"), None)
            .await
            .unwrap();
        assert_eq!(declared.mime_type.as_deref(), Some("application/x-custom"));
    }

    #[tokio::test]
    async fn failed_commit_releases_credential() {
        let fx = fixture(ANY_RULE, auth_config());
        // A file where the blob directory should be makes every storage call fail.
        std::fs::write(fx.dir.path().join("blobs"), b"in the way").unwrap();
        let cred = credential("retry-me", "alice", Some(3));

        let err = fx
            .pipeline
            .accept(body(b"abc"), Some("text/plain"), Some(&cred))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Storage(_)));
        assert!(!fx.metadata.is_credential_consumed("retry-me").unwrap());
        assert!(fx.metadata.get_blob(&BlobHash::of(b"abc")).unwrap().is_none());
        assert!(staging_is_empty(fx.dir.path()));

        std::fs::remove_file(fx.dir.path().join("blobs")).unwrap();
        let record = fx
            .pipeline
            .accept(body(b"abc"), Some("text/plain"), Some(&cred))
            .await
            .unwrap();
        assert_eq!(record.subject_keys, vec!["alice"]);
        assert!(fx.metadata.is_credential_consumed("retry-me").unwrap());
    }

    #[tokio::test]
    async fn upload_waits_for_claim_on_its_hash() {
        let fx = fixture(ANY_RULE, open_config());
        let payload = b"contended bytes";
        let hash = BlobHash::of(payload);
        let held = fx.claims.try_claim(&hash).unwrap();

        let upload = fx.pipeline.accept(body(payload), Some("text/plain"), None);
        tokio::pin!(upload);
        assert!(tokio::time::timeout(Duration::from_millis(100), &mut upload)
            .await
            .is_err());
        assert!(fx.metadata.get_blob(&hash).unwrap().is_none());

        drop(held);
        let record = tokio::time::timeout(Duration::from_secs(5), upload)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.hash, hash);
        assert!(fx.storage.has(&hash).await.unwrap());
    }
}
