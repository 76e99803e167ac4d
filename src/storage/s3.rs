// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! S3-compatible object store backend.
//!
//! Blobs are stored as objects keyed by `{prefix}{sha256}`. Requests use
//! path-style addressing with static credentials so that MinIO, Garage and
//! other self-hosted stores work alongside AWS.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};
use url::Url;

use super::{BlobStorage, BlobStream, StorageError, StorageResult, StoredObject};
use crate::config::S3Config;
use crate::models::BlobHash;

pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    public_url: Option<Url>,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("client", &"<S3Client>")
            .finish()
    }
}

fn object_store_error(context: &str, e: impl std::error::Error) -> StorageError {
    let message = format!("{context}: {}", DisplayErrorContext(&e));
    error!(error = %message, "S3 request failed");
    StorageError::ObjectStore(message)
}

impl S3Storage {
    /// Build a client for the configured endpoint and static credentials.
    pub async fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "blossom-static",
        );

        debug!(endpoint = %config.endpoint, bucket = %config.bucket, "Configuring S3 client");
        let sdk_config = aws_config::from_env()
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint.as_str())
            .credentials_provider(credentials)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Self::with_client(config, aws_sdk_s3::Client::from_conf(s3_config))
    }

    /// Use a pre-built client.
    pub fn with_client(config: &S3Config, client: aws_sdk_s3::Client) -> Self {
        Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone().unwrap_or_default(),
            public_url: config.public_url.clone(),
        }
    }

    fn key(&self, hash: &BlobHash) -> String {
        format!("{}{}", self.prefix, hash)
    }

    async fn head(&self, hash: &BlobHash) -> StorageResult<Option<u64>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(hash))
            .send()
            .await
        {
            Ok(output) => Ok(Some(output.content_length().unwrap_or(0).max(0) as u64)),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(object_store_error("head_object", e)),
        }
    }
}

#[async_trait]
impl BlobStorage for S3Storage {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn setup(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                StorageError::Unavailable(format!(
                    "bucket '{}': {}",
                    self.bucket,
                    DisplayErrorContext(&e)
                ))
            })?;
        info!(bucket = %self.bucket, "S3 blob storage ready");
        Ok(())
    }

    async fn has(&self, hash: &BlobHash) -> StorageResult<bool> {
        Ok(self.head(hash).await?.is_some())
    }

    async fn get(&self, hash: &BlobHash) -> StorageResult<BlobStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(hash))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::NotFound(hash.clone())
                } else {
                    object_store_error("get_object", e)
                }
            })?;

        Ok(ReaderStream::new(output.body.into_async_read()).boxed())
    }

    async fn put(&self, hash: &BlobHash, staged: &Path) -> StorageResult<u64> {
        if let Some(size) = self.head(hash).await? {
            debug!(hash = %hash, "Object already stored, dropping staged copy");
            tokio::fs::remove_file(staged).await.ok();
            return Ok(size);
        }

        let size = tokio::fs::metadata(staged).await?.len();
        let body = ByteStream::from_path(staged)
            .await
            .map_err(|e| object_store_error("read staged file", e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(hash))
            .content_length(size as i64)
            .body(body)
            .send()
            .await
            .map_err(|e| object_store_error("put_object", e))?;

        tokio::fs::remove_file(staged).await.ok();
        debug!(bucket = %self.bucket, hash = %hash, size, "S3 object uploaded");
        Ok(size)
    }

    async fn remove(&self, hash: &BlobHash) -> StorageResult<()> {
        // DeleteObject succeeds for missing keys, so check first.
        if self.head(hash).await?.is_none() {
            return Err(StorageError::NotFound(hash.clone()));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(hash))
            .send()
            .await
            .map_err(|e| object_store_error("delete_object", e))?;

        debug!(bucket = %self.bucket, hash = %hash, "S3 object deleted");
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if !self.prefix.is_empty() {
                request = request.prefix(&self.prefix);
            }
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let page = request
                .send()
                .await
                .map_err(|e| object_store_error("list_objects_v2", e))?;

            for object in page.contents() {
                let Some(hash) = object
                    .key()
                    .and_then(|key| key.strip_prefix(self.prefix.as_str()))
                    .and_then(|name| name.parse::<BlobHash>().ok())
                else {
                    continue;
                };
                objects.push(StoredObject {
                    hash,
                    size: object.size().unwrap_or(0).max(0) as u64,
                    modified: object
                        .last_modified()
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), 0)),
                });
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }

    fn public_url(&self, hash: &BlobHash, ext: Option<&str>) -> Option<Url> {
        let base = self.public_url.as_ref()?;
        let mut name = self.key(hash);
        if let Some(ext) = ext {
            name.push('.');
            name.push_str(ext);
        }
        base.join(&name).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(public_url: Option<&str>, prefix: Option<&str>) -> S3Config {
        S3Config {
            endpoint: Url::parse("http://127.0.0.1:9000").unwrap(),
            access_key: "key".into(),
            secret_key: "secret".into(),
            bucket: "blobs".into(),
            region: "us-east-1".into(),
            prefix: prefix.map(str::to_string),
            public_url: public_url.map(|u| Url::parse(u).unwrap()),
        }
    }

    fn client() -> aws_sdk_s3::Client {
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        aws_sdk_s3::Client::from_conf(conf)
    }

    #[test]
    fn keys_carry_prefix() {
        let storage = S3Storage::with_client(&config(None, Some("cdn/")), client());
        let hash = BlobHash::of(b"x");
        assert_eq!(storage.key(&hash), format!("cdn/{hash}"));
    }

    #[test]
    fn public_url_override() {
        let hash = BlobHash::of(b"x");

        let without = S3Storage::with_client(&config(None, None), client());
        assert!(without.public_url(&hash, Some("png")).is_none());

        let with = S3Storage::with_client(&config(Some("https://cdn.example.com/"), None), client());
        assert_eq!(
            with.public_url(&hash, Some("png")).unwrap().as_str(),
            format!("https://cdn.example.com/{hash}.png")
        );
    }
}
