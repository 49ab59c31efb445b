//! Launcher - run の開始（controller 側）
//!
//! 1. 既存の RunState があれば即座に拒否（何も作らない）
//! 2. 認証・quota の preflight
//! 3. compute instance を作成
//! 4. 初期 RunState を作成。失敗したら孤児 instance を片付けてからエラーを返す

use std::sync::Arc;
use std::time::Duration;

use crate::app::cleanup::CleanupAgent;
use crate::app::retry::Retrier;
use crate::app::state_store::StateStore;
use crate::domain::{RunError, RunState};
use crate::ports::{Clock, ComputeProfile, ComputeProvisioner, IdGenerator, InstanceSpec};

/// What to launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub profile: ComputeProfile,
    /// Passed through to the trainer untouched.
    pub training_config: serde_json::Value,
}

pub struct Launcher {
    store: StateStore,
    compute: Arc<dyn ComputeProvisioner>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    retrier: Retrier,
    compute_timeout: Duration,
    cleanup: CleanupAgent,
}

impl Launcher {
    pub fn new(
        store: StateStore,
        compute: Arc<dyn ComputeProvisioner>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        retrier: Retrier,
        compute_timeout: Duration,
        cleanup: CleanupAgent,
    ) -> Self {
        Self {
            store,
            compute,
            ids,
            clock,
            retrier,
            compute_timeout,
            cleanup,
        }
    }

    pub async fn launch(&self, request: LaunchRequest) -> Result<RunState, RunError> {
        if let Some(active) = self.store.try_read().await? {
            tracing::warn!(run_id = %active.run_id, status = %active.status, "launch refused");
            return Err(RunError::AlreadyActive {
                run_id: active.run_id,
            });
        }

        let spec = InstanceSpec {
            run_id: self.ids.generate_run_id(),
            environment: self.store.environment().to_string(),
            profile: request.profile,
        };
        let run_id = spec.run_id.clone();
        let compute = &*self.compute;
        let spec_ref = &spec;

        self.retrier
            .run("compute.check_access", self.compute_timeout, || {
                compute.check_access(spec_ref)
            })
            .await?;

        let instance_id = self
            .retrier
            .run("compute.create", self.compute_timeout, || compute.create(spec_ref))
            .await?;
        tracing::info!(
            run_id = %run_id,
            instance_id = %instance_id,
            instance_type = %spec.profile.instance_type,
            "instance created"
        );

        let state = RunState::new(
            run_id.clone(),
            instance_id.clone(),
            request.training_config,
            self.clock.now(),
        );
        if let Err(e) = self.store.create(&state).await {
            tracing::error!(run_id = %run_id, error = %e, "could not record run, tearing down instance");
            self.cleanup.cleanup(&run_id, &instance_id).await;
            return Err(e);
        }

        tracing::info!(run_id = %run_id, environment = %self.store.environment(), "run launched");
        Ok(state)
    }
}
