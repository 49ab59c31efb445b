//! RunArtifacts - run ごとの記録（training.json / cleanup_status.json）
//!
//! `{env}/runs/{run_id}/<name>` に置かれ、RunState の削除後も残ります。

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::app::retry::Retrier;
use crate::app::state_store::put_json_atomic;
use crate::domain::artifact::{CLEANUP_REPORT, TRAINING_REPORT};
use crate::domain::{CleanupReport, RunError, RunId, TrainingReport};
use crate::ports::BlobStore;

#[derive(Clone)]
pub struct RunArtifacts {
    blob: Arc<dyn BlobStore>,
    retrier: Retrier,
    environment: String,
    timeout: Duration,
}

impl RunArtifacts {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        retrier: Retrier,
        environment: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            blob,
            retrier,
            environment: environment.into(),
            timeout,
        }
    }

    pub fn key(&self, run_id: &RunId, name: &str) -> String {
        format!("{}/runs/{run_id}/{name}", self.environment)
    }

    pub async fn write_training(&self, report: &TrainingReport) -> Result<(), RunError> {
        self.write(&report.run_id, TRAINING_REPORT, report).await
    }

    pub async fn read_training(&self, run_id: &RunId) -> Result<Option<TrainingReport>, RunError> {
        self.read(run_id, TRAINING_REPORT).await
    }

    pub async fn write_cleanup(&self, report: &CleanupReport) -> Result<(), RunError> {
        self.write(&report.run_id, CLEANUP_REPORT, report).await
    }

    pub async fn read_cleanup(&self, run_id: &RunId) -> Result<Option<CleanupReport>, RunError> {
        self.read(run_id, CLEANUP_REPORT).await
    }

    async fn write<T: Serialize>(&self, run_id: &RunId, name: &str, value: &T) -> Result<(), RunError> {
        let key = self.key(run_id, name);
        put_json_atomic(&*self.blob, &self.retrier, self.timeout, &key, value).await?;
        tracing::info!(run_id = %run_id, key = %key, "artifact written");
        Ok(())
    }

    async fn read<T: DeserializeOwned>(&self, run_id: &RunId, name: &str) -> Result<Option<T>, RunError> {
        let key = self.key(run_id, name);
        let (blob, key_ref) = (&*self.blob, key.as_str());
        match self
            .retrier
            .run("artifact.read", self.timeout, || blob.get(key_ref))
            .await
        {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(RunError::Storage(e)) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
