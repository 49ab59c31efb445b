//! CleanupAgent - 課金リソースの冪等な後片付け
//!
//! # 順序
//! 1. compute_instance（課金）
//! 2. ephemeral_storage（課金）
//! 3. state_temp_object（見た目だけ）
//! 4. workdir（worker 上のみ）
//! 5. cleanup_status.json を書く（既存の記録があればマージ）
//! 6. RunState を削除（最後）
//!
//! 各ステップは独立して失敗でき、失敗しても次へ進みます。
//! 何度呼んでも同じ結果に収束します（存在しないものは `not_found`）。
//! 戻り値はその回の結果、cleanup_status.json は全試行をまとめた記録です。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::app::artifacts::RunArtifacts;
use crate::app::retry::Retrier;
use crate::app::state_store::StateStore;
use crate::domain::{
    CleanupReport, Decision, ErrorClass, InstanceId, ManagedResource, ResourceOutcome, RunError,
    RunId,
};
use crate::ports::{Clock, ComputeProvisioner};

#[derive(Clone)]
pub struct CleanupAgent {
    store: StateStore,
    artifacts: RunArtifacts,
    compute: Arc<dyn ComputeProvisioner>,
    clock: Arc<dyn Clock>,
    retrier: Retrier,
    compute_timeout: Duration,
    workdir: Option<PathBuf>,
    /// Bound on waiting for attached storage to be released by a terminating instance.
    detach_wait: Duration,
    detach_poll: Duration,
    discard_unreadable_state: bool,
}

fn is_compute_not_found(err: &RunError) -> bool {
    matches!(err, RunError::Compute(e) if e.is_not_found())
}

fn is_compute_in_use(err: &RunError) -> bool {
    matches!(err, RunError::Compute(e) if e.is_in_use())
}

impl CleanupAgent {
    pub fn new(
        store: StateStore,
        artifacts: RunArtifacts,
        compute: Arc<dyn ComputeProvisioner>,
        clock: Arc<dyn Clock>,
        retrier: Retrier,
        compute_timeout: Duration,
    ) -> Self {
        Self {
            store,
            artifacts,
            compute,
            clock,
            retrier,
            compute_timeout,
            workdir: None,
            detach_wait: Duration::from_secs(120),
            detach_poll: Duration::from_secs(5),
            discard_unreadable_state: false,
        }
    }

    pub fn with_detach_wait(mut self, wait: Duration, poll: Duration) -> Self {
        self.detach_wait = wait;
        self.detach_poll = poll;
        self
    }

    /// Delete a state object that no longer parses instead of reporting it failed.
    ///
    /// Only for callers that named the run explicitly.
    pub fn discarding_unreadable_state(mut self) -> Self {
        self.discard_unreadable_state = true;
        self
    }

    /// Also remove this local working directory (worker side).
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Tear down everything the run may have left behind. Never fails.
    pub async fn cleanup(&self, run_id: &RunId, instance_id: &InstanceId) -> CleanupReport {
        tracing::info!(run_id = %run_id, instance_id = %instance_id, "cleanup started");
        let mut report = CleanupReport::new(run_id.clone(), instance_id.clone());

        let outcome = self.teardown_instance(instance_id).await;
        self.record(&mut report, ManagedResource::ComputeInstance, outcome);

        let outcome = self.teardown_storage(run_id, instance_id).await;
        self.record(&mut report, ManagedResource::EphemeralStorage, outcome);

        let outcome = match self.store.remove_temp().await {
            Ok(true) => Ok(ResourceOutcome::deleted(self.clock.now())),
            Ok(false) => Ok(ResourceOutcome::not_found(self.clock.now())),
            Err(e) => Err(e),
        };
        self.record(&mut report, ManagedResource::StateTempObject, outcome);

        if let Some(workdir) = &self.workdir {
            let outcome = match tokio::fs::remove_dir_all(workdir).await {
                Ok(()) => Ok(ResourceOutcome::deleted(self.clock.now())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Ok(ResourceOutcome::not_found(self.clock.now()))
                }
                Err(e) => Err(RunError::Io(e)),
            };
            self.record(&mut report, ManagedResource::Workdir, outcome);
        }

        self.persist(&report).await;

        // state object goes last: while it exists the run still counts as active
        let outcome = match self.store.delete(run_id).await {
            Ok(true) => Ok(ResourceOutcome::deleted(self.clock.now())),
            Ok(false) => Ok(ResourceOutcome::not_found(self.clock.now())),
            Err(RunError::RunMismatch { found, .. }) => {
                tracing::warn!(run_id = %run_id, other = %found, "state belongs to another run, left in place");
                Ok(ResourceOutcome::not_found(self.clock.now()))
            }
            Err(RunError::CorruptState(reason)) if self.discard_unreadable_state => {
                tracing::warn!(run_id = %run_id, reason = %reason, "discarding unreadable state");
                match self.store.discard().await {
                    Ok(true) => Ok(ResourceOutcome::deleted(self.clock.now())),
                    Ok(false) => Ok(ResourceOutcome::not_found(self.clock.now())),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };
        self.record(&mut report, ManagedResource::StateObject, outcome);

        if report.manual_action_required {
            tracing::error!(
                run_id = %run_id,
                instance_id = %instance_id,
                "cleanup incomplete, billable resources may remain; manual action required"
            );
        } else {
            tracing::info!(run_id = %run_id, failures = report.has_failures(), "cleanup finished");
        }
        report
    }

    async fn teardown_instance(&self, instance_id: &InstanceId) -> Result<ResourceOutcome, RunError> {
        let compute = &*self.compute;
        let described = self
            .retrier
            .run("compute.describe", self.compute_timeout, || compute.describe(instance_id))
            .await;
        match described {
            Ok(state) if state.is_terminated() => {
                return Ok(ResourceOutcome::not_found(self.clock.now()));
            }
            Err(e) if is_compute_not_found(&e) => {
                return Ok(ResourceOutcome::not_found(self.clock.now()));
            }
            Err(e) => {
                // describe is advisory; terminate is attempted regardless
                tracing::warn!(instance_id = %instance_id, error = %e, "describe failed");
            }
            Ok(_) => {}
        }

        match self
            .retrier
            .run("compute.terminate", self.compute_timeout, || compute.terminate(instance_id))
            .await
        {
            Ok(state) if state.is_terminating() => Ok(ResourceOutcome::deleted(self.clock.now())),
            Ok(state) => Ok(ResourceOutcome::failed(
                format!("instance still {state} after terminate"),
                self.clock.now(),
            )),
            Err(e) if is_compute_not_found(&e) => Ok(ResourceOutcome::not_found(self.clock.now())),
            Err(e) => Err(e),
        }
    }

    async fn teardown_storage(
        &self,
        run_id: &RunId,
        instance_id: &InstanceId,
    ) -> Result<ResourceOutcome, RunError> {
        let compute = &*self.compute;
        let volumes = self
            .retrier
            .run("compute.list_storage", self.compute_timeout, || compute.list_storage(run_id))
            .await?;
        if volumes.is_empty() {
            return Ok(ResourceOutcome::not_found(self.clock.now()));
        }

        let mut errors = Vec::new();
        let mut attached = Vec::new();
        for volume in &volumes {
            match self.delete_volume(volume).await {
                Ok(()) => tracing::debug!(run_id = %run_id, volume = %volume, "storage deleted"),
                Err(e) if is_compute_in_use(&e) => attached.push(volume.as_str()),
                Err(e) => errors.push(format!("{volume}: {e}")),
            }
        }

        // volumes of a shutting-down instance are released once it is terminated
        if !attached.is_empty() {
            self.wait_for_release(instance_id).await;
            for volume in attached {
                if let Err(e) = self.delete_volume(volume).await {
                    errors.push(format!("{volume}: {e}"));
                }
            }
        }

        if errors.is_empty() {
            Ok(ResourceOutcome::deleted(self.clock.now()))
        } else {
            Ok(ResourceOutcome::failed(errors.join("; "), self.clock.now()))
        }
    }

    async fn delete_volume(&self, volume: &str) -> Result<(), RunError> {
        let compute = &*self.compute;
        match self
            .retrier
            .run("compute.delete_storage", self.compute_timeout, || {
                compute.delete_storage(volume)
            })
            .await
        {
            Err(e) if is_compute_not_found(&e) => Ok(()),
            other => other,
        }
    }

    /// Poll until the instance is terminated (or gone), at most `detach_wait`.
    async fn wait_for_release(&self, instance_id: &InstanceId) {
        let compute = &*self.compute;
        let wait = async {
            loop {
                tokio::time::sleep(self.detach_poll).await;
                match compute.describe(instance_id).await {
                    Ok(state) if state.is_terminated() => return,
                    Err(e) if e.is_not_found() => return,
                    Ok(state) => tracing::debug!(instance_id = %instance_id, state = %state, "waiting for storage release"),
                    Err(e) => tracing::warn!(instance_id = %instance_id, error = %e, "describe failed"),
                }
            }
        };
        if tokio::time::timeout(self.detach_wait, wait).await.is_err() {
            tracing::warn!(instance_id = %instance_id, wait = ?self.detach_wait, "storage still attached");
        }
    }

    /// Merge this attempt into `cleanup_status.json`.
    async fn persist(&self, report: &CleanupReport) {
        let merged = match self.artifacts.read_cleanup(&report.run_id).await {
            Ok(Some(mut earlier)) => {
                earlier.absorb(report);
                earlier
            }
            Ok(None) => report.clone(),
            Err(e) => {
                tracing::warn!(run_id = %report.run_id, error = %e, "earlier cleanup record unreadable, replacing it");
                report.clone()
            }
        };
        if let Err(e) = self.artifacts.write_cleanup(&merged).await {
            self.log_failure(&report.run_id, "cleanup_report", &e);
        }
    }

    fn record(
        &self,
        report: &mut CleanupReport,
        resource: ManagedResource,
        outcome: Result<ResourceOutcome, RunError>,
    ) {
        let outcome = outcome.unwrap_or_else(|e| {
            self.log_failure(&report.run_id, resource.name(), &e);
            ResourceOutcome::failed(e.to_string(), self.clock.now())
        });
        tracing::info!(
            run_id = %report.run_id,
            resource = resource.name(),
            status = ?outcome.status,
            "cleanup step"
        );
        report.record(resource, outcome);
    }

    fn log_failure(&self, run_id: &RunId, resource: &str, err: &RunError) {
        if let Decision::LogAndContinue { reason } = self
            .retrier
            .classifier()
            .decide(ErrorClass::CleanupError, 1)
        {
            tracing::warn!(run_id = %run_id, resource, error = %err, "{reason}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ResourceStatus, RunState};
    use crate::impls::{ComputeFault, ComputeOp, InMemoryBlobStore, InMemoryProvisioner};
    use crate::ports::{BlobStore, ComputeProfile, InstanceSpec, SystemClock};

    struct Fixture {
        blob: InMemoryBlobStore,
        compute: InMemoryProvisioner,
        store: StateStore,
        agent: CleanupAgent,
    }

    fn fixture(compute: InMemoryProvisioner) -> Fixture {
        let blob = InMemoryBlobStore::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let retrier = Retrier::default();
        let timeout = Duration::from_secs(30);
        let store = StateStore::new(Arc::new(blob.clone()), clock.clone(), retrier.clone(), "dev", timeout);
        let artifacts = RunArtifacts::new(Arc::new(blob.clone()), retrier.clone(), "dev", timeout);
        let agent = CleanupAgent::new(
            store.clone(),
            artifacts,
            Arc::new(compute.clone()),
            clock,
            retrier,
            timeout,
        );
        Fixture {
            blob,
            compute,
            store,
            agent,
        }
    }

    async fn launch(f: &Fixture, run: &str) -> InstanceId {
        let spec = InstanceSpec {
            run_id: RunId::new(run),
            environment: "dev".into(),
            profile: ComputeProfile::new("g5.xlarge"),
        };
        let instance_id = f.compute.create(&spec).await.unwrap();
        f.store
            .create(&RunState::new(
                RunId::new(run),
                instance_id.clone(),
                serde_json::json!({}),
                chrono::Utc::now(),
            ))
            .await
            .unwrap();
        instance_id
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let f = fixture(InMemoryProvisioner::new().with_volumes(2));
        let instance_id = launch(&f, "R1").await;
        let run_id = RunId::new("R1");

        let first = f.agent.cleanup(&run_id, &instance_id).await;
        assert_eq!(first.status_of(ManagedResource::ComputeInstance), Some(ResourceStatus::Deleted));
        assert_eq!(first.status_of(ManagedResource::EphemeralStorage), Some(ResourceStatus::Deleted));
        assert_eq!(first.status_of(ManagedResource::StateObject), Some(ResourceStatus::Deleted));
        assert!(!first.manual_action_required);

        let second = f.agent.cleanup(&run_id, &instance_id).await;
        for resource in [
            ManagedResource::ComputeInstance,
            ManagedResource::EphemeralStorage,
            ManagedResource::StateTempObject,
            ManagedResource::StateObject,
        ] {
            assert_eq!(second.status_of(resource), Some(ResourceStatus::NotFound), "{resource:?}");
        }
        assert!(!second.has_failures());
        assert_eq!(f.compute.running_count().await, 0);
        assert_eq!(f.compute.storage_count().await, 0);

        // the persisted record keeps what the first attempt did
        let persisted = f.agent.artifacts.read_cleanup(&run_id).await.unwrap().unwrap();
        assert_eq!(
            persisted.status_of(ManagedResource::ComputeInstance),
            Some(ResourceStatus::Deleted)
        );
        assert_eq!(
            persisted.status_of(ManagedResource::EphemeralStorage),
            Some(ResourceStatus::Deleted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manual_action_flag_survives_a_successful_retry() {
        let f = fixture(InMemoryProvisioner::new());
        let instance_id = launch(&f, "R1").await;
        let run_id = RunId::new("R1");
        f.compute
            .fail_next(ComputeOp::Terminate, 1, ComputeFault::Credentials)
            .await;

        let first = f.agent.cleanup(&run_id, &instance_id).await;
        assert!(first.manual_action_required);

        let second = f.agent.cleanup(&run_id, &instance_id).await;
        assert_eq!(second.status_of(ManagedResource::ComputeInstance), Some(ResourceStatus::Deleted));
        assert!(!second.manual_action_required);

        let persisted = f.agent.artifacts.read_cleanup(&run_id).await.unwrap().unwrap();
        assert_eq!(
            persisted.status_of(ManagedResource::ComputeInstance),
            Some(ResourceStatus::Deleted)
        );
        assert!(persisted.manual_action_required);
    }

    #[tokio::test]
    async fn root_volume_goes_with_the_instance() {
        let f = fixture(InMemoryProvisioner::new().with_root_volume());
        let instance_id = launch(&f, "R1").await;

        let report = f.agent.cleanup(&RunId::new("R1"), &instance_id).await;

        assert_eq!(report.status_of(ManagedResource::EphemeralStorage), Some(ResourceStatus::NotFound));
        assert!(!report.manual_action_required);
        assert_eq!(f.compute.calls(ComputeOp::DeleteStorage).await, 0);
        assert_eq!(f.compute.storage_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attached_volume_is_deleted_after_termination_completes() {
        let f = fixture(
            InMemoryProvisioner::new()
                .with_volumes(1)
                .with_root_volume()
                .with_gradual_termination(),
        );
        let instance_id = launch(&f, "R1").await;

        let report = f.agent.cleanup(&RunId::new("R1"), &instance_id).await;

        assert_eq!(report.status_of(ManagedResource::ComputeInstance), Some(ResourceStatus::Deleted));
        assert_eq!(report.status_of(ManagedResource::EphemeralStorage), Some(ResourceStatus::Deleted));
        assert!(!report.manual_action_required);
        // first delete hit the still-attached volume
        assert_eq!(f.compute.calls(ComputeOp::DeleteStorage).await, 2);
        assert_eq!(f.compute.storage_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn volume_still_attached_after_wait_requires_manual_action() {
        let f = fixture(InMemoryProvisioner::new().with_volumes(1));
        let instance_id = launch(&f, "R1").await;
        // terminate keeps failing, so the volume never detaches
        f.compute
            .fail_next(ComputeOp::Terminate, 5, ComputeFault::Credentials)
            .await;
        let agent = f
            .agent
            .clone()
            .with_detach_wait(Duration::from_secs(30), Duration::from_secs(5));

        let report = agent.cleanup(&RunId::new("R1"), &instance_id).await;

        assert_eq!(report.status_of(ManagedResource::EphemeralStorage), Some(ResourceStatus::Failed));
        assert!(report.manual_action_required);
    }

    #[tokio::test]
    async fn unreadable_state_is_discarded_only_when_asked() {
        let f = fixture(InMemoryProvisioner::new());
        f.blob
            .put(f.store.key(), b"not json".to_vec())
            .await
            .unwrap();
        let run_id = RunId::new("R1");
        let instance_id = InstanceId::new("i-gone");

        let report = f.agent.cleanup(&run_id, &instance_id).await;
        assert_eq!(report.status_of(ManagedResource::StateObject), Some(ResourceStatus::Failed));
        assert!(f.store.exists().await.unwrap());

        let report = f
            .agent
            .clone()
            .discarding_unreadable_state()
            .cleanup(&run_id, &instance_id)
            .await;
        assert_eq!(report.status_of(ManagedResource::StateObject), Some(ResourceStatus::Deleted));
        assert!(!f.store.exists().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_terminate_requires_manual_action_but_continues() {
        let f = fixture(InMemoryProvisioner::new());
        let instance_id = launch(&f, "R1").await;
        f.compute
            .fail_next(ComputeOp::Terminate, 5, ComputeFault::Credentials)
            .await;

        let report = f.agent.cleanup(&RunId::new("R1"), &instance_id).await;

        assert_eq!(report.status_of(ManagedResource::ComputeInstance), Some(ResourceStatus::Failed));
        assert!(report.manual_action_required);
        // later steps still ran
        assert_eq!(report.status_of(ManagedResource::StateObject), Some(ResourceStatus::Deleted));
        let persisted = f
            .blob
            .get("dev/runs/R1/cleanup_status.json")
            .await
            .unwrap();
        let persisted: serde_json::Value = serde_json::from_slice(&persisted).unwrap();
        assert_eq!(persisted["manual_action_required"], true);
    }

    #[tokio::test]
    async fn foreign_state_is_left_alone() {
        let f = fixture(InMemoryProvisioner::new());
        launch(&f, "R2").await;

        let report = f
            .agent
            .cleanup(&RunId::new("R1"), &InstanceId::new("i-gone"))
            .await;

        assert_eq!(report.status_of(ManagedResource::ComputeInstance), Some(ResourceStatus::NotFound));
        assert_eq!(f.store.read().await.unwrap().run_id, RunId::new("R2"));
    }

    #[tokio::test]
    async fn workdir_is_removed_on_worker() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("run");
        tokio::fs::create_dir_all(workdir.join("model")).await.unwrap();

        let f = fixture(InMemoryProvisioner::new());
        let instance_id = launch(&f, "R1").await;
        let agent = f.agent.clone().with_workdir(&workdir);

        let report = agent.cleanup(&RunId::new("R1"), &instance_id).await;
        assert_eq!(report.status_of(ManagedResource::Workdir), Some(ResourceStatus::Deleted));
        assert!(!workdir.exists());
    }
}
