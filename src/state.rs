// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use tracing::info;
use url::Url;

use crate::claims::HashClaims;
use crate::config::Config;
use crate::content_type::extension_for_mime;
use crate::discovery::{RelayDiscovery, UpstreamHosts};
use crate::models::{BlobDescriptor, BlobRecord};
use crate::pruner::Pruner;
use crate::resolver::Resolver;
use crate::rules::RuleEngine;
use crate::staging::StagingArea;
use crate::storage::{create_storage, BlobStorage, MetadataError, MetadataStore, StorageError};
use crate::transport::{HttpTransport, RemoteFetchError};
use crate::upload::UploadPipeline;

/// Failures that prevent the server from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("storage backend '{backend}' failed setup: {source}")]
    Storage {
        backend: &'static str,
        source: StorageError,
    },

    #[error("failed to open metadata database: {0}")]
    Metadata(#[from] MetadataError),

    #[error("failed to prepare staging directory: {0}")]
    Staging(std::io::Error),

    #[error("failed to build HTTP client: {0}")]
    Transport(#[from] RemoteFetchError),
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<dyn BlobStorage>,
    pub metadata: Arc<MetadataStore>,
    pub rules: Arc<RuleEngine>,
    pub resolver: Arc<Resolver>,
    pub uploads: Arc<UploadPipeline>,
    pub claims: HashClaims,
}

impl AppState {
    /// Wire every component from the configuration. Storage setup failure
    /// is fatal.
    pub async fn build(config: Config) -> Result<Self, StartupError> {
        let storage = create_storage(&config.storage).await;
        storage
            .setup()
            .await
            .map_err(|source| StartupError::Storage {
                backend: storage.name(),
                source,
            })?;

        let metadata = Arc::new(MetadataStore::open(&config.database_path)?);
        info!(path = %config.database_path.display(), "Metadata database opened");

        let staging = StagingArea::new(config.staging_dir());
        staging.prepare().await.map_err(StartupError::Staging)?;

        let rules = Arc::new(RuleEngine::new(
            config.rules.clone(),
            config.upload.require_pubkey_in_rule,
        ));

        let claims = HashClaims::default();
        let transport = HttpTransport::new(config.discovery.fetch_timeout)?;
        let mut resolver = Resolver::new(
            storage.clone(),
            metadata.clone(),
            rules.clone(),
            staging.clone(),
            transport,
            claims.clone(),
        );
        let discovery = &config.discovery;
        if discovery.nostr_enabled && !discovery.relays.is_empty() {
            resolver = resolver.with_discovery(Arc::new(RelayDiscovery::new(
                discovery.relays.clone(),
                discovery.fetch_timeout,
            )));
        }
        if discovery.upstream_enabled {
            resolver = resolver.with_upstream(UpstreamHosts::new(discovery.upstream_domains.clone()));
        }
        info!(sources = ?resolver.sources(), rules = rules.rules().len(), "Blob resolver ready");

        let uploads = UploadPipeline::new(
            storage.clone(),
            metadata.clone(),
            rules.clone(),
            staging,
            claims.clone(),
            config.upload.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            storage,
            metadata,
            rules,
            resolver: Arc::new(resolver),
            uploads: Arc::new(uploads),
            claims,
        })
    }

    pub fn pruner(&self) -> Pruner {
        Pruner::new(
            self.storage.clone(),
            self.metadata.clone(),
            self.claims.clone(),
            self.config.pruner.clone(),
        )
    }

    /// Public URL for a blob: the backend's own if it has one, otherwise
    /// `{PUBLIC_DOMAIN}/{hash}.{ext}`.
    pub fn blob_url(&self, record: &BlobRecord) -> String {
        let ext = record.mime_type.as_deref().and_then(extension_for_mime);
        if let Some(url) = self.storage.public_url(&record.hash, ext) {
            return url.to_string();
        }

        let name = match ext {
            Some(ext) => format!("{}.{ext}", record.hash),
            None => record.hash.to_string(),
        };
        self.config
            .public_domain
            .join(&name)
            .map(String::from)
            .unwrap_or_else(|_| format!("{}/{name}", self.config.public_domain.as_str().trim_end_matches('/')))
    }

    pub fn descriptor(&self, record: &BlobRecord) -> BlobDescriptor {
        BlobDescriptor {
            url: self.blob_url(record),
            sha256: record.hash.to_string(),
            size: record.size,
            mime_type: record.mime_type.clone(),
            created: record.created,
        }
    }
}
