//! Durable file-per-key [`StorageBackend`].
//!
//! Each key maps to one file in a flat directory; the filename is the hex of
//! the key bytes so arbitrary key strings stay filesystem-safe and reversible.
//! Writes go through a temp file plus rename, which is atomic per key on the
//! filesystems this SDK targets.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::StorageError;
use crate::storage::backend::StorageBackend;

/// File-backed storage rooted at one directory.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Opens (and creates if needed) the backing directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] when the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", hex::encode(key.as_bytes())))
    }

    fn key_from_path(path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }

    fn map_io(err: std::io::Error) -> StorageError {
        if err.kind() == std::io::ErrorKind::StorageFull {
            StorageError::QuotaExceeded
        } else {
            StorageError::Io(err)
        }
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn put(&self, key: &str, raw: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &raw).await.map_err(Self::map_io)?;
        fs::rename(&tmp, &path).await.map_err(Self::map_io)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(key)).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(key) = Self::key_from_path(&path) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(path).await?;
            }
        }
        Ok(())
    }

    async fn estimated_bytes(&self) -> Result<u64, StorageError> {
        let mut total = 0;
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if let Ok(meta) = entry.metadata().await {
                total += meta.len();
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path()).await.unwrap();
            backend.put("auth:token", b"secret".to_vec()).await.unwrap();
        }

        // A fresh backend over the same directory sees the data.
        let backend = FileBackend::open(dir.path()).await.unwrap();
        assert_eq!(
            backend.get("auth:token").await.unwrap(),
            Some(b"secret".to_vec())
        );
    }

    #[tokio::test]
    async fn keys_decode_back_to_originals() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();

        backend.put("queue:item:a/b c", vec![1]).await.unwrap();
        backend.put("plain", vec![2]).await.unwrap();

        let mut keys = backend.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["plain", "queue:item:a/b c"]);
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();

        backend.put("a", vec![1]).await.unwrap();
        backend.put("b", vec![2]).await.unwrap();

        assert!(backend.delete("a").await.unwrap());
        assert!(!backend.delete("a").await.unwrap());

        backend.clear().await.unwrap();
        assert!(backend.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        assert_eq!(backend.get("nope").await.unwrap(), None);
    }
}
