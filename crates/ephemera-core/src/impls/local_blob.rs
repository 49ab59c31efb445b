//! LocalBlobStore - ファイルシステム上の BlobStore
//!
//! key はルートディレクトリからの相対パスになります。
//! rename(2) は同一ファイルシステム内で atomic なので、共有マウント
//! （NFS/EFS, s3 マウントなど）を state の置き場所として使えます。

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::ports::{BlobError, BlobStore};

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key, refusing anything that would escape the root.
    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(BlobError::Denied(format!("invalid key: {key}")));
        }
        Ok(self.root.join(relative))
    }
}

fn map_io(key: &str, err: std::io::Error) -> BlobError {
    match err.kind() {
        ErrorKind::NotFound => BlobError::NotFound(key.to_string()),
        ErrorKind::PermissionDenied => BlobError::Denied(format!("{key}: {err}")),
        _ => BlobError::Io(err),
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| map_io(key, e))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(key, e))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| map_io(key, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), BlobError> {
        let from_path = self.path_for(from)?;
        let to_path = self.path_for(to)?;
        if let Some(parent) = to_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(to, e))?;
        }
        tokio::fs::rename(&from_path, &to_path)
            .await
            .map_err(|e| map_io(from, e))
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_io(key, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| map_io(key, e))
    }
}
