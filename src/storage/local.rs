// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Local directory backend: each blob is a file named by its hash.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BlobStorage, BlobStream, StorageError, StorageResult, StoredObject};
use crate::models::BlobHash;

const HEALTH_CHECK_FILE: &str = ".health_check";

#[derive(Debug, Clone)]
pub struct LocalStorage {
    dir: PathBuf,
}

impl LocalStorage {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn blob_path(&self, hash: &BlobHash) -> PathBuf {
        self.dir.join(hash.as_str())
    }

    /// Move a staged file into place. Falls back to copy + rename when the
    /// staging area lives on another filesystem.
    async fn move_into_place(&self, staged: &Path, target: &Path) -> io::Result<()> {
        if fs::rename(staged, target).await.is_ok() {
            return Ok(());
        }

        self.copy_into_place(staged, target).await
    }

    /// Copy through a uniquely named sibling so concurrent writers of the
    /// same hash never share a partial file.
    async fn copy_into_place(&self, staged: &Path, target: &Path) -> io::Result<()> {
        let partial = self.dir.join(format!(".partial-{}", Uuid::new_v4()));
        if let Err(e) = fs::copy(staged, &partial).await {
            fs::remove_file(&partial).await.or_else(ignore_not_found)?;
            return Err(e);
        }
        if let Err(e) = fs::rename(&partial, target).await {
            fs::remove_file(&partial).await.or_else(ignore_not_found)?;
            return Err(e);
        }
        fs::remove_file(staged).await.or_else(ignore_not_found)
    }
}

fn ignore_not_found(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

fn map_not_found(hash: &BlobHash) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(hash.clone())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl BlobStorage for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    /// Create the directory and verify a write, read back and delete.
    async fn setup(&self) -> StorageResult<()> {
        let unavailable =
            |e: io::Error| StorageError::Unavailable(format!("{}: {e}", self.dir.display()));

        fs::create_dir_all(&self.dir).await.map_err(unavailable)?;

        let marker = self.dir.join(HEALTH_CHECK_FILE);
        let data = b"health_check_data";
        fs::write(&marker, data).await.map_err(unavailable)?;
        let read_back = fs::read(&marker).await.map_err(unavailable)?;
        fs::remove_file(&marker).await.map_err(unavailable)?;

        if read_back != data {
            return Err(StorageError::Unavailable(format!(
                "{}: health check data mismatch",
                self.dir.display()
            )));
        }

        info!(path = %self.dir.display(), "Local blob storage ready");
        Ok(())
    }

    async fn check(&self) -> StorageResult<()> {
        match fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StorageError::Unavailable(format!(
                "{}: not a directory",
                self.dir.display()
            ))),
            Err(e) => Err(StorageError::Unavailable(format!("{}: {e}", self.dir.display()))),
        }
    }

    async fn has(&self, hash: &BlobHash) -> StorageResult<bool> {
        match fs::metadata(self.blob_path(hash)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, hash: &BlobHash) -> StorageResult<BlobStream> {
        let file = fs::File::open(self.blob_path(hash))
            .await
            .map_err(map_not_found(hash))?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn put(&self, hash: &BlobHash, staged: &Path) -> StorageResult<u64> {
        let target = self.blob_path(hash);

        if let Ok(existing) = fs::metadata(&target).await {
            debug!(hash = %hash, "Blob already stored, dropping staged copy");
            fs::remove_file(staged).await.or_else(ignore_not_found)?;
            return Ok(existing.len());
        }

        fs::create_dir_all(&self.dir).await?;
        self.move_into_place(staged, &target).await?;
        let size = fs::metadata(&target).await?.len();

        debug!(hash = %hash, size, "Stored blob");
        Ok(size)
    }

    async fn remove(&self, hash: &BlobHash) -> StorageResult<()> {
        fs::remove_file(self.blob_path(hash))
            .await
            .map_err(map_not_found(hash))
    }

    async fn list(&self) -> StorageResult<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(objects),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Some(hash) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<BlobHash>().ok())
            else {
                continue;
            };
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            objects.push(StoredObject {
                hash,
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn stage(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, data).await.unwrap();
        path
    }

    async fn read_all(mut stream: BlobStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn put_get_remove_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("blobs"));
        storage.setup().await.unwrap();

        let data = b"some blob bytes";
        let hash = BlobHash::of(data);
        let staged = stage(dir.path(), "staged", data).await;

        assert!(!storage.has(&hash).await.unwrap());
        assert_eq!(storage.put(&hash, &staged).await.unwrap(), data.len() as u64);
        assert!(storage.has(&hash).await.unwrap());
        assert!(!staged.exists(), "staged file is consumed");

        let body = read_all(storage.get(&hash).await.unwrap()).await;
        assert_eq!(BlobHash::of(&body), hash);

        storage.remove(&hash).await.unwrap();
        assert!(!storage.has(&hash).await.unwrap());
        assert!(matches!(
            storage.remove(&hash).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.get(&hash).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("blobs"));
        storage.setup().await.unwrap();

        let data = b"same bytes";
        let hash = BlobHash::of(data);
        let first = stage(dir.path(), "a", data).await;
        let second = stage(dir.path(), "b", data).await;

        storage.put(&hash, &first).await.unwrap();
        storage.put(&hash, &second).await.unwrap();

        assert!(!second.exists());
        let listed = storage.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].hash, hash);
        assert_eq!(listed[0].size, data.len() as u64);
    }

    #[tokio::test]
    async fn concurrent_copies_of_one_hash_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("blobs"));
        storage.setup().await.unwrap();

        let data = vec![5u8; 256 * 1024];
        let hash = BlobHash::of(&data);
        let target = storage.blob_path(&hash);
        let first = stage(dir.path(), "first", &data).await;
        let second = stage(dir.path(), "second", &data).await;

        let (a, b) = tokio::join!(
            storage.copy_into_place(&first, &target),
            storage.copy_into_place(&second, &target),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(fs::read(&target).await.unwrap(), data);
        assert!(!first.exists() && !second.exists());
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir.path().join("blobs")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().into_string().unwrap());
        }
        assert_eq!(names, vec![hash.to_string()]);
    }

    #[tokio::test]
    async fn list_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.setup().await.unwrap();
        fs::write(dir.path().join("README"), b"not a blob").await.unwrap();

        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn check_reports_missing_directory_without_creating_it() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = dir.path().join("blobs");
        let storage = LocalStorage::new(&blobs);

        assert!(matches!(storage.check().await, Err(StorageError::Unavailable(_))));
        assert!(!blobs.exists());

        storage.setup().await.unwrap();
        storage.check().await.unwrap();
    }

    #[tokio::test]
    async fn setup_fails_when_directory_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"x").await.unwrap();

        let storage = LocalStorage::new(file.join("blobs"));
        assert!(matches!(
            storage.setup().await,
            Err(StorageError::Unavailable(_))
        ));
    }
}
