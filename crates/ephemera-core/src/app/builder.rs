//! AppBuilder - コンポーネントの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;
use std::time::Duration;

use crate::app::artifacts::RunArtifacts;
use crate::app::cleanup::CleanupAgent;
use crate::app::executor::{PhaseExecutor, WorkerOptions, WorkerParts};
use crate::app::killer::Killer;
use crate::app::launcher::Launcher;
use crate::app::monitor::Monitor;
use crate::app::retry::Retrier;
use crate::app::state_store::StateStore;
use crate::domain::{ErrorClassifier, RetryPolicy};
use crate::ports::{
    BlobStore, Clock, ComputeProfile, ComputeProvisioner, IdGenerator, SystemClock, UlidGenerator,
};

/// Per-call timeouts for remote operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeouts {
    pub storage: Duration,
    pub compute: Duration,
    pub sync: Duration,
    pub trainer: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            storage: Duration::from_secs(30),
            compute: Duration::from_secs(120),
            sync: Duration::from_secs(3600),
            trainer: Duration::from_secs(24 * 3600),
        }
    }
}

/// AppBuilder は App を構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .environment("dev")
///     .blob_store(Arc::new(LocalBlobStore::new("/mnt/state")))
///     .compute(Arc::new(AwsCliProvisioner::new(None)))
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - environment / blob_store / compute は必須
/// - build() 時に不足をまとめて BuildError として返す
pub struct AppBuilder {
    environment: Option<String>,
    blob: Option<Arc<dyn BlobStore>>,
    compute: Option<Arc<dyn ComputeProvisioner>>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    retry_policy: RetryPolicy,
    timeouts: Timeouts,
    profile: Option<ComputeProfile>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing components: {0:?}. These must be set before build().")]
    MissingComponents(Vec<&'static str>),

    #[error("Invalid environment name {0:?}: use letters, digits, '-' or '_'")]
    InvalidEnvironment(String),

    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            environment: None,
            blob: None,
            compute: None,
            clock: Arc::new(SystemClock),
            ids: None,
            retry_policy: RetryPolicy::standard(),
            timeouts: Timeouts::default(),
            profile: None,
        }
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn blob_store(mut self, blob: Arc<dyn BlobStore>) -> Self {
        self.blob = Some(blob);
        self
    }

    pub fn compute(mut self, compute: Arc<dyn ComputeProvisioner>) -> Self {
        self.compute = Some(compute);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to a ULID generator on the builder's clock.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Used by the Killer's cost estimate.
    pub fn profile(mut self, profile: ComputeProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        let mut missing = Vec::new();
        if self.environment.is_none() {
            missing.push("environment");
        }
        if self.blob.is_none() {
            missing.push("blob_store");
        }
        if self.compute.is_none() {
            missing.push("compute");
        }
        let (Some(environment), Some(blob), Some(compute)) =
            (self.environment, self.blob, self.compute)
        else {
            return Err(BuildError::MissingComponents(missing));
        };

        let valid_name = !environment.is_empty()
            && environment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_name {
            return Err(BuildError::InvalidEnvironment(environment));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(BuildError::InvalidRetryPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let clock = self.clock;
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))) as Arc<dyn IdGenerator>);
        let retrier = Retrier::new(ErrorClassifier::new(self.retry_policy));
        let store = StateStore::new(
            Arc::clone(&blob),
            Arc::clone(&clock),
            retrier.clone(),
            environment.as_str(),
            self.timeouts.storage,
        );
        let artifacts = RunArtifacts::new(
            blob,
            retrier.clone(),
            environment.as_str(),
            self.timeouts.storage,
        );

        Ok(App {
            environment,
            store,
            artifacts,
            compute,
            clock,
            ids,
            retrier,
            timeouts: self.timeouts,
            profile: self.profile,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wired components of one environment.
pub struct App {
    environment: String,
    store: StateStore,
    artifacts: RunArtifacts,
    compute: Arc<dyn ComputeProvisioner>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    retrier: Retrier,
    timeouts: Timeouts,
    profile: Option<ComputeProfile>,
}

impl App {
    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn artifacts(&self) -> &RunArtifacts {
        &self.artifacts
    }

    pub fn cleanup_agent(&self) -> CleanupAgent {
        CleanupAgent::new(
            self.store.clone(),
            self.artifacts.clone(),
            Arc::clone(&self.compute),
            Arc::clone(&self.clock),
            self.retrier.clone(),
            self.timeouts.compute,
        )
    }

    pub fn launcher(&self) -> Launcher {
        Launcher::new(
            self.store.clone(),
            Arc::clone(&self.compute),
            Arc::clone(&self.ids),
            Arc::clone(&self.clock),
            self.retrier.clone(),
            self.timeouts.compute,
            self.cleanup_agent(),
        )
    }

    /// Worker-side executor. `options` timeouts are taken from the app's.
    pub fn executor(&self, parts: WorkerParts, mut options: WorkerOptions) -> PhaseExecutor {
        options.sync_timeout = self.timeouts.sync;
        options.trainer_timeout = self.timeouts.trainer;
        PhaseExecutor::new(
            self.store.clone(),
            self.artifacts.clone(),
            self.cleanup_agent(),
            parts,
            Arc::clone(&self.clock),
            self.retrier.clone(),
            options,
        )
    }

    pub fn monitor(&self, interval: Duration) -> Monitor {
        Monitor::new(
            self.store.clone(),
            self.artifacts.clone(),
            Arc::clone(&self.clock),
            interval,
        )
    }

    pub fn killer(&self) -> Killer {
        Killer::new(
            self.store.clone(),
            Arc::clone(&self.compute),
            self.cleanup_agent(),
            Arc::clone(&self.clock),
            self.retrier.clone(),
            self.timeouts.compute,
            self.profile.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryBlobStore, InMemoryProvisioner};

    #[test]
    fn test_build_success() {
        let app = AppBuilder::new()
            .environment("dev")
            .blob_store(Arc::new(InMemoryBlobStore::new()))
            .compute(Arc::new(InMemoryProvisioner::new()))
            .build()
            .unwrap();
        assert_eq!(app.store().key(), "dev/system-state.json");
    }

    #[test]
    fn test_build_missing_components() {
        let app = AppBuilder::new()
            .blob_store(Arc::new(InMemoryBlobStore::new()))
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingComponents(missing)) if missing == vec!["environment", "compute"]
        ));
    }

    #[test]
    fn test_build_invalid_environment() {
        let app = AppBuilder::new()
            .environment("../prod")
            .blob_store(Arc::new(InMemoryBlobStore::new()))
            .compute(Arc::new(InMemoryProvisioner::new()))
            .build();
        assert!(matches!(app, Err(BuildError::InvalidEnvironment(_))));
    }
}
