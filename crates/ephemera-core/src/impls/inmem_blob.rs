//! InMemoryBlobStore - 開発・テスト用の BlobStore
//!
//! # 学習ポイント
//! - tokio::sync::Mutex で HashMap を守る（ロックを跨いで await しない）
//! - Notify による「tmp 書き込み後・rename 前」のフック
//! - 障害注入（一時的なエラーを N 回返す）

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::ports::{BlobError, BlobStore};

/// Operations that can be counted and faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobOp {
    Get,
    Put,
    Rename,
    Delete,
    Exists,
}

/// Kind of fault to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Transient (retriable).
    Unavailable,
    /// Permanent (terminal).
    Denied,
}

impl Fault {
    fn to_error(self, op: BlobOp) -> BlobError {
        match self {
            Fault::Unavailable => BlobError::Unavailable(format!("injected fault on {op:?}")),
            Fault::Denied => BlobError::Denied(format!("injected fault on {op:?}")),
        }
    }
}

/// Pauses the next `rename` between the temp write and the move.
pub struct RenameGate {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

impl RenameGate {
    /// Resolves once a writer is parked inside `rename`.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Let the parked writer finish its rename.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
struct Inner {
    objects: HashMap<String, Vec<u8>>,
    faults: HashMap<BlobOp, (u32, Fault)>,
    calls: HashMap<BlobOp, u32>,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl Inner {
    /// Count the call and return an injected fault if one is armed.
    fn enter(&mut self, op: BlobOp) -> Result<(), BlobError> {
        *self.calls.entry(op).or_default() += 1;
        if let Some((remaining, fault)) = self.faults.get_mut(&op)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(fault.to_error(op));
        }
        Ok(())
    }
}

/// BlobStore backed by a HashMap.
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail with `fault`.
    pub async fn fail_next(&self, op: BlobOp, times: u32, fault: Fault) {
        self.inner.lock().await.faults.insert(op, (times, fault));
    }

    /// Number of calls made to `op` so far (including faulted ones).
    pub async fn calls(&self, op: BlobOp) -> u32 {
        self.inner.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Arm a gate on the next rename.
    pub async fn gate_next_rename(&self) -> RenameGate {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        self.inner.lock().await.gate = Some((Arc::clone(&reached), Arc::clone(&release)));
        RenameGate { reached, release }
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().await.objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Seed an object directly, bypassing fault injection.
    pub async fn insert(&self, key: &str, bytes: Vec<u8>) {
        self.inner
            .lock()
            .await
            .objects
            .insert(key.to_string(), bytes);
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let mut inner = self.inner.lock().await;
        inner.enter(BlobOp::Get)?;
        inner
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let mut inner = self.inner.lock().await;
        inner.enter(BlobOp::Put)?;
        inner.objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), BlobError> {
        let gate = {
            let mut inner = self.inner.lock().await;
            inner.enter(BlobOp::Rename)?;
            inner.gate.take()
        };

        // ロックを離した状態で待つ（reader はこの間も読める）
        if let Some((reached, release)) = gate {
            reached.notify_one();
            release.notified().await;
        }

        let mut inner = self.inner.lock().await;
        let bytes = inner
            .objects
            .remove(from)
            .ok_or_else(|| BlobError::NotFound(from.to_string()))?;
        inner.objects.insert(to.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let mut inner = self.inner.lock().await;
        inner.enter(BlobOp::Delete)?;
        Ok(inner.objects.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        let mut inner = self.inner.lock().await;
        inner.enter(BlobOp::Exists)?;
        Ok(inner.objects.contains_key(key))
    }
}
