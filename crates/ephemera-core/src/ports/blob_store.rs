//! BlobStore port - RunState / artifact を置くリモートストレージ
//!
//! StateStore はこの trait の上に atomic write（tmp へ書いてから rename）を
//! 組み立てます。実装は rename が「上書きを含めて 1 回で見える」ことを保証する
//! 必要があります。

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Network blip, throttling, 5xx.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Bad credentials or missing permission.
    #[error("access denied: {0}")]
    Denied(String),

    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        match self {
            BlobError::Unavailable(_) => true,
            BlobError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            BlobError::NotFound(_) | BlobError::Denied(_) => false,
        }
    }
}

/// Key/value blob storage with atomic rename.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a whole object. Absent keys return `BlobError::NotFound`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    /// Write a whole object, replacing any previous value.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError>;

    /// Move `from` onto `to` in one step, overwriting `to`.
    async fn rename(&self, from: &str, to: &str) -> Result<(), BlobError>;

    /// Delete an object. Returns false if it was already absent.
    async fn delete(&self, key: &str) -> Result<bool, BlobError>;

    async fn exists(&self, key: &str) -> Result<bool, BlobError>;
}
