//! Errors - エラー型と分類
//!
//! すべての失敗は `RunError` として表現され、`ErrorClassifier` が
//! retriable / terminal / cleanup-error のいずれかに分類します。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::RunId;
use super::state::RunStatus;
use crate::ports::{BlobError, ComputeError};

/// ErrorClass は失敗の運用分類
///
/// - Retriable: 一時的なエラー（bounded backoff でリトライ）
/// - Terminal: この run では回復不能（cleanup へ）
/// - CleanupError: CleanupAgent 内部の失敗（ログして次へ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retriable,
    Terminal,
    CleanupError,
}

/// Errors raised by the lifecycle engine.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run already active, run_id={run_id}")]
    AlreadyActive { run_id: RunId },

    #[error("no run state found")]
    StateNotFound,

    #[error("invalid run state: {0}")]
    InvalidState(String),

    /// The state object exists but does not parse.
    #[error("state object is unreadable: {0}")]
    CorruptState(String),

    /// A failure recorded by an earlier worker, picked up again on restart.
    #[error("run already failed: {0}")]
    PriorFailure(String),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("state object belongs to run_id={found}, expected run_id={expected}")]
    RunMismatch { expected: RunId, found: RunId },

    #[error("storage: {0}")]
    Storage(#[from] BlobError),

    #[error("compute: {0}")]
    Compute(#[from] ComputeError),

    #[error("preflight check failed: {0}")]
    Preflight(String),

    #[error("data sync failed: {message}")]
    Sync { message: String, transient: bool },

    #[error("trainer exited with code {0}")]
    TrainerExit(i32),

    #[error("trainer could not be run: {0}")]
    Trainer(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: String, after: Duration },

    #[error("{op} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: String,
        attempts: u32,
        last: Box<RunError>,
    },

    #[error("run killed: {0}")]
    Killed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Was this run stopped by a kill (Killer or watchdog) rather than by a failure?
    pub fn is_kill(&self) -> bool {
        matches!(self, RunError::Killed(_))
    }
}
