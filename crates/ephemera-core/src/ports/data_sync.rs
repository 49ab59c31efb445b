//! DataSync port - 学習データの取り込み（sync-in）と成果物の書き出し（sync-out）

use std::path::Path;

use async_trait::async_trait;

use crate::domain::{RunError, RunId};

/// Moves data between the run's workdir and durable storage.
///
/// Both directions must be safe to repeat: the retry driver may call them again
/// after a transient failure.
#[async_trait]
pub trait DataSync: Send + Sync {
    async fn sync_in(&self, run_id: &RunId, workdir: &Path) -> Result<(), RunError>;

    async fn sync_out(&self, run_id: &RunId, workdir: &Path) -> Result<(), RunError>;
}
