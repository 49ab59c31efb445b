//! StateStore - RunState の唯一の読み書き口
//!
//! # 学習ポイント
//! - 書き込みは常に「`{key}.tmp` に全体を書く → rename」の 2 段階
//! - `write_atomic` は read-modify-write。mutator はコピーに適用され、
//!   schema と状態遷移を検証してから書き込む
//! - CAS は無い（last-write-wins）。exists→create の競合は既知の制約

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::app::retry::Retrier;
use crate::domain::{RunError, RunId, RunState};
use crate::ports::{BlobStore, Clock};

/// Object name of the run state inside an environment prefix.
pub const STATE_OBJECT: &str = "system-state.json";

/// Suffix of the staging object used by every atomic write.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Serialize `value` to `{key}.tmp`, then rename it onto `key`.
///
/// Readers of `key` see either the previous document or the new one.
pub(crate) async fn put_json_atomic<T: Serialize>(
    blob: &dyn BlobStore,
    retrier: &Retrier,
    timeout: Duration,
    key: &str,
    value: &T,
) -> Result<(), RunError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let temp = format!("{key}{TEMP_SUFFIX}");
    let (temp, bytes) = (temp.as_str(), &bytes);

    retrier
        .run("blob.put", timeout, || blob.put(temp, bytes.clone()))
        .await?;
    retrier
        .run("blob.rename", timeout, || blob.rename(temp, key))
        .await
}

/// Read access to the single RunState of an environment.
#[derive(Clone)]
pub struct StateStore {
    blob: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    retrier: Retrier,
    environment: String,
    key: String,
    temp_key: String,
    timeout: Duration,
}

impl StateStore {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        retrier: Retrier,
        environment: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let environment = environment.into();
        let key = format!("{environment}/{STATE_OBJECT}");
        let temp_key = format!("{key}{TEMP_SUFFIX}");
        Self {
            blob,
            clock,
            retrier,
            environment,
            key,
            temp_key,
            timeout,
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn temp_key(&self) -> &str {
        &self.temp_key
    }

    /// Latest state, or `StateNotFound` when no run is active.
    pub async fn read(&self) -> Result<RunState, RunError> {
        self.try_read().await?.ok_or(RunError::StateNotFound)
    }

    /// Latest state, `None` when no run is active.
    pub async fn try_read(&self) -> Result<Option<RunState>, RunError> {
        let (blob, key) = (&*self.blob, self.key.as_str());
        let bytes = match self
            .retrier
            .run("state.read", self.timeout, || blob.get(key))
            .await
        {
            Ok(bytes) => bytes,
            Err(RunError::Storage(e)) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let state: RunState = serde_json::from_slice(&bytes)
            .map_err(|e| RunError::CorruptState(format!("{}: {e}", self.key)))?;
        Ok(Some(state))
    }

    pub async fn exists(&self) -> Result<bool, RunError> {
        let (blob, key) = (&*self.blob, self.key.as_str());
        self.retrier
            .run("state.exists", self.timeout, || blob.exists(key))
            .await
    }

    /// Write the initial document of a run.
    ///
    /// Refuses when another run's state is present. The check and the write are
    /// two separate calls, so two racing launchers can both pass it.
    pub async fn create(&self, state: &RunState) -> Result<(), RunError> {
        state.validate()?;
        if let Some(active) = self.try_read().await? {
            return Err(RunError::AlreadyActive {
                run_id: active.run_id,
            });
        }
        self.put(state).await?;
        tracing::info!(run_id = %state.run_id, key = %self.key, "run state created");
        Ok(())
    }

    /// Read the latest state, apply `mutator` to a copy, validate and write it.
    ///
    /// The mutator may return an error to abort without writing.
    pub async fn write_atomic<F>(&self, mutator: F) -> Result<RunState, RunError>
    where
        F: FnOnce(&mut RunState) -> Result<(), RunError>,
    {
        let previous = self.read().await?;
        let mut next = previous.clone();
        mutator(&mut next)?;
        next.updated_at = Some(self.clock.now());

        next.validate()?;
        next.validate_successor_of(&previous)?;
        self.put(&next).await?;

        if next.status != previous.status {
            tracing::info!(
                run_id = %next.run_id,
                from = %previous.status,
                to = %next.status,
                step = %next.current_step,
                "status changed"
            );
        } else {
            tracing::debug!(run_id = %next.run_id, step = %next.current_step, "state written");
        }
        Ok(next)
    }

    /// Delete the state if it belongs to `run_id`. Returns false when absent.
    pub async fn delete(&self, run_id: &RunId) -> Result<bool, RunError> {
        match self.try_read().await? {
            None => return Ok(false),
            Some(state) if state.run_id != *run_id => {
                return Err(RunError::RunMismatch {
                    expected: run_id.clone(),
                    found: state.run_id,
                });
            }
            Some(_) => {}
        }
        let (blob, key) = (&*self.blob, self.key.as_str());
        let deleted = self
            .retrier
            .run("state.delete", self.timeout, || blob.delete(key))
            .await?;
        tracing::info!(run_id = %run_id, "run state deleted");
        Ok(deleted)
    }

    /// Delete the state object without reading it.
    ///
    /// Only for an unreadable document whose owner the caller already knows.
    pub async fn discard(&self) -> Result<bool, RunError> {
        let (blob, key) = (&*self.blob, self.key.as_str());
        let deleted = self
            .retrier
            .run("state.discard", self.timeout, || blob.delete(key))
            .await?;
        tracing::warn!(key = %self.key, "run state discarded unread");
        Ok(deleted)
    }

    /// Remove a staging object left behind by an interrupted write.
    pub async fn remove_temp(&self) -> Result<bool, RunError> {
        let (blob, key) = (&*self.blob, self.temp_key.as_str());
        self.retrier
            .run("state.remove_temp", self.timeout, || blob.delete(key))
            .await
    }

    async fn put(&self, state: &RunState) -> Result<(), RunError> {
        put_json_atomic(&*self.blob, &self.retrier, self.timeout, &self.key, state).await
    }
}
