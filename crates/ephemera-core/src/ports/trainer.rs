//! Trainer port - 学習本体（不透明なブラックボックス）
//!
//! PhaseExecutor は exit code だけを見ます。学習の中身には立ち入りません。

use std::path::Path;

use async_trait::async_trait;

use crate::domain::RunError;

/// Opaque training step.
#[async_trait]
pub trait Trainer: Send + Sync {
    /// Run training to completion and return its exit code (0 = success).
    ///
    /// `Err` means the trainer could not be run at all (e.g. binary missing).
    async fn run(&self, config: &serde_json::Value, workdir: &Path) -> Result<i32, RunError>;
}
