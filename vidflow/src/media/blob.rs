//! Blob store: opaque keys mapped to media files.

use std::future::Future;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::utils::fs;
use crate::{Error, Result};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Local path the engine can read the blob from directly.
    async fn resolve(&self, key: &str) -> Result<PathBuf>;
    /// Copy a blob to `dest`.
    async fn download(&self, key: &str, dest: &Path) -> Result<()>;
    /// Store the file at `src` under `key`, replacing any previous blob.
    async fn upload(&self, src: &Path, key: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Bytes>;
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
}

/// Blob store rooted at a local directory; keys are relative paths.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let well_formed = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !well_formed {
            return Err(Error::storage(format!("invalid blob key '{key}'")));
        }
        Ok(self.root.join(relative))
    }

    async fn existing(&self, key: &str) -> Result<PathBuf> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(Error::not_found("Blob", key)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("Blob", key))
            }
            Err(e) => Err(Error::io_path("reading blob", &path, e)),
        }
    }

    /// Sibling temp name so readers never see a half-written blob.
    fn staging_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}.part", uuid::Uuid::new_v4().simple()));
        path.with_file_name(name)
    }

    /// Run `write` against a staging file, then move it into place. The
    /// staging file never outlives a failed write or rename.
    async fn write_staged<F, Fut>(path: &Path, op: &'static str, write: F) -> Result<()>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = std::io::Result<()>>,
    {
        let staging = Self::staging_path(path);
        if let Err(e) = write(staging.clone()).await {
            let _ = fs::remove_file_if_exists(&staging).await;
            return Err(Error::io_path(op, path, e));
        }
        if let Err(e) = tokio::fs::rename(&staging, path).await {
            let _ = fs::remove_file_if_exists(&staging).await;
            return Err(Error::io_path("committing blob", path, e));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn resolve(&self, key: &str) -> Result<PathBuf> {
        self.existing(key).await
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<()> {
        let path = self.existing(key).await?;
        fs::ensure_parent_dir("creating download directory", dest).await?;
        tokio::fs::copy(&path, dest)
            .await
            .map_err(|e| Error::io_path("downloading blob", dest, e))?;
        debug!(key, dest = %dest.display(), "Downloaded blob");
        Ok(())
    }

    async fn upload(&self, src: &Path, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        fs::ensure_parent_dir("creating blob directory", &path).await?;
        Self::write_staged(&path, "uploading blob", |staging| async move {
            tokio::fs::copy(src, &staging).await.map(|_| ())
        })
        .await?;
        debug!(key, src = %src.display(), "Uploaded blob");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.existing(key).await?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::io_path("reading blob", &path, e))?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        fs::ensure_parent_dir("creating blob directory", &path).await?;
        Self::write_staged(&path, "writing blob", |staging| async move {
            tokio::fs::write(&staging, &data).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        store
            .put("raw/clip.mp4", Bytes::from_static(b"frames"))
            .await
            .unwrap();

        assert_eq!(store.get("raw/clip.mp4").await.unwrap(), Bytes::from_static(b"frames"));
        let resolved = store.resolve("raw/clip.mp4").await.unwrap();
        assert_eq!(resolved, dir.path().join("raw/clip.mp4"));
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("blobs"));
        let src = dir.path().join("out.mp4");
        std::fs::write(&src, b"merged").unwrap();

        store.upload(&src, "merged/job-1.mp4").await.unwrap();
        let dest = dir.path().join("scratch/copy.mp4");
        store.download("merged/job-1.mp4", &dest).await.unwrap();

        assert_eq!(std::fs::read(dest).unwrap(), b"merged");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("blobs/merged"))
            .unwrap()
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    fn part_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "part"))
            .collect()
    }

    #[tokio::test]
    async fn test_failed_write_drops_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("clip.mp4");

        let err = FsBlobStore::write_staged(&target, "writing blob", |staging| async move {
            std::fs::write(&staging, b"half a frame")?;
            Err::<(), _>(std::io::Error::other("disk full"))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::IoPath { .. }), "{err:?}");
        assert!(part_files(dir.path()).is_empty());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_no_partial_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("blobs"));

        let err = store
            .upload(&dir.path().join("missing.mp4"), "merged/job-2.mp4")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::IoPath { .. }), "{err:?}");
        assert!(part_files(&dir.path().join("blobs/merged")).is_empty());
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let err = store.resolve("raw/none.mp4").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        for key in ["", "../etc/passwd", "/abs/key", "a/../../b"] {
            let err = store.put(key, Bytes::new()).await.unwrap_err();
            assert!(matches!(err, Error::Storage(_)), "key {key:?}");
        }
    }
}
