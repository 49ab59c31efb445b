//! Killer - operator による強制停止
//!
//! 1. `killed` を書き込む（cleanup / failed / killed なら書かない）
//! 2. instance を terminate し、terminated になるまで（上限つきで）待つ
//! 3. それでも state が残っていれば worker は応答していないので、自分で cleanup する

use std::sync::Arc;
use std::time::Duration;

use crate::app::cleanup::CleanupAgent;
use crate::app::monitor::format_elapsed;
use crate::app::retry::Retrier;
use crate::app::state_store::StateStore;
use crate::domain::{CleanupReport, InstanceId, RunError, RunId, RunStatus};
use crate::ports::{Clock, ComputeProfile, ComputeProvisioner, InstanceState};

#[derive(Debug, Clone)]
pub struct KillOptions {
    pub reason: String,
    /// Upper bound on waiting for the instance to report `terminated`.
    pub wait: Duration,
    pub poll_interval: Duration,
}

impl Default for KillOptions {
    fn default() -> Self {
        Self {
            reason: "killed by operator".to_string(),
            wait: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KillReport {
    pub run_id: RunId,
    pub instance_id: InstanceId,
    pub previous_status: RunStatus,
    /// Whether this call wrote `killed`.
    pub recorded: bool,
    /// Instance reached `terminated` (or was already gone) within the wait.
    pub terminated: bool,
    pub elapsed: Option<Duration>,
    pub estimated_cost_usd: Option<f64>,
    /// Present when the Killer had to clean up itself.
    pub cleanup: Option<CleanupReport>,
}

impl KillReport {
    pub fn succeeded(&self) -> bool {
        self.terminated
            && self
                .cleanup
                .as_ref()
                .is_none_or(|report| !report.manual_action_required)
    }

    pub fn summary(&self) -> String {
        let elapsed = self
            .elapsed
            .map(format_elapsed)
            .unwrap_or_else(|| "unknown".to_string());
        let cost = self
            .estimated_cost_usd
            .map(|c| format!("${c:.2}"))
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "run={} instance={} terminated={} elapsed={} estimated_cost={}",
            self.run_id, self.instance_id, self.terminated, elapsed, cost
        )
    }
}

pub struct Killer {
    store: StateStore,
    compute: Arc<dyn ComputeProvisioner>,
    cleanup: CleanupAgent,
    clock: Arc<dyn Clock>,
    retrier: Retrier,
    compute_timeout: Duration,
    profile: Option<ComputeProfile>,
}

fn is_compute_not_found(err: &RunError) -> bool {
    matches!(err, RunError::Compute(e) if e.is_not_found())
}

impl Killer {
    pub fn new(
        store: StateStore,
        compute: Arc<dyn ComputeProvisioner>,
        cleanup: CleanupAgent,
        clock: Arc<dyn Clock>,
        retrier: Retrier,
        compute_timeout: Duration,
        profile: Option<ComputeProfile>,
    ) -> Self {
        Self {
            store,
            compute,
            cleanup,
            clock,
            retrier,
            compute_timeout,
            profile,
        }
    }

    pub async fn kill(&self, options: &KillOptions) -> Result<KillReport, RunError> {
        let state = self.store.read().await?;
        let run_id = state.run_id.clone();
        let instance_id = state.instance_id.clone();

        let recorded = if state.status.is_active() {
            let now = self.clock.now();
            match self
                .store
                .write_atomic(|s| s.kill(options.reason.as_str(), now))
                .await
            {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "could not record kill");
                    false
                }
            }
        } else {
            tracing::info!(run_id = %run_id, status = %state.status, "run already winding down, kill not recorded");
            false
        };

        let terminated = self.terminate_and_wait(&instance_id, options).await;

        let cleanup = match self.store.try_read().await {
            Ok(Some(current)) if current.run_id == run_id => {
                tracing::warn!(run_id = %run_id, "state still present, worker did not clean up");
                Some(self.cleanup.cleanup(&run_id, &instance_id).await)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "could not check state, cleaning up");
                Some(self.cleanup.cleanup(&run_id, &instance_id).await)
            }
        };

        let elapsed = state
            .elapsed(self.clock.now())
            .and_then(|d| d.to_std().ok());
        let estimated_cost_usd = match (&self.profile, elapsed) {
            (Some(profile), Some(elapsed)) => profile.estimate_cost(elapsed),
            _ => None,
        };

        let report = KillReport {
            run_id,
            instance_id,
            previous_status: state.status,
            recorded,
            terminated,
            elapsed,
            estimated_cost_usd,
            cleanup,
        };
        tracing::info!(summary = %report.summary(), "kill finished");
        Ok(report)
    }

    /// Request termination, then poll until `terminated` or the wait runs out.
    async fn terminate_and_wait(&self, instance_id: &InstanceId, options: &KillOptions) -> bool {
        let compute = &*self.compute;
        match self
            .retrier
            .run("compute.terminate", self.compute_timeout, || compute.terminate(instance_id))
            .await
        {
            Ok(state) if state.is_terminated() => return true,
            Ok(state) => tracing::info!(instance_id = %instance_id, state = %state, "termination requested"),
            Err(e) if is_compute_not_found(&e) => return true,
            Err(e) => {
                tracing::error!(instance_id = %instance_id, error = %e, "terminate failed");
                return false;
            }
        }

        let wait = async {
            loop {
                tokio::time::sleep(options.poll_interval).await;
                match compute.describe(instance_id).await {
                    Ok(InstanceState::Terminated) => return true,
                    Err(e) if e.is_not_found() => return true,
                    Ok(state) => tracing::debug!(instance_id = %instance_id, state = %state, "waiting for termination"),
                    Err(e) => tracing::warn!(instance_id = %instance_id, error = %e, "describe failed"),
                }
            }
        };
        match tokio::time::timeout(options.wait, wait).await {
            Ok(done) => done,
            Err(_) => {
                tracing::warn!(instance_id = %instance_id, wait = ?options.wait, "instance not terminated within wait");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::artifacts::RunArtifacts;
    use crate::domain::{ManagedResource, ResourceStatus, RunState};
    use crate::impls::{InMemoryBlobStore, InMemoryProvisioner};
    use crate::ports::{InstanceSpec, SystemClock};

    struct Fixture {
        compute: InMemoryProvisioner,
        store: StateStore,
        killer: Killer,
    }

    fn fixture(compute: InMemoryProvisioner) -> Fixture {
        let blob = Arc::new(InMemoryBlobStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let retrier = Retrier::default();
        let timeout = Duration::from_secs(30);
        let store = StateStore::new(blob.clone(), clock.clone(), retrier.clone(), "dev", timeout);
        let artifacts = RunArtifacts::new(blob, retrier.clone(), "dev", timeout);
        let cleanup = CleanupAgent::new(
            store.clone(),
            artifacts,
            Arc::new(compute.clone()),
            clock.clone(),
            retrier.clone(),
            timeout,
        );
        let mut profile = ComputeProfile::new("g5.xlarge");
        profile.hourly_cost_usd = Some(1.0);
        let killer = Killer::new(
            store.clone(),
            Arc::new(compute.clone()),
            cleanup,
            clock,
            retrier,
            timeout,
            Some(profile),
        );
        Fixture {
            compute,
            store,
            killer,
        }
    }

    async fn launch(f: &Fixture) -> InstanceId {
        let instance_id = f
            .compute
            .create(&InstanceSpec {
                run_id: RunId::new("R1"),
                environment: "dev".into(),
                profile: ComputeProfile::new("g5.xlarge"),
            })
            .await
            .unwrap();
        f.store
            .create(&RunState::new(
                RunId::new("R1"),
                instance_id.clone(),
                serde_json::json!({}),
                chrono::Utc::now() - chrono::Duration::minutes(30),
            ))
            .await
            .unwrap();
        instance_id
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_worker_is_cleaned_up_by_killer() {
        let f = fixture(InMemoryProvisioner::new().with_gradual_termination());
        let instance_id = launch(&f).await;

        let report = f.killer.kill(&KillOptions::default()).await.unwrap();

        assert!(report.recorded);
        assert!(report.terminated);
        assert_eq!(f.compute.state_of(&instance_id).await, Some(InstanceState::Terminated));
        let cleanup = report.cleanup.as_ref().unwrap();
        assert_eq!(
            cleanup.status_of(ManagedResource::StateObject),
            Some(ResourceStatus::Deleted)
        );
        assert!(f.store.try_read().await.unwrap().is_none());
        assert!(report.succeeded());

        let cost = report.estimated_cost_usd.unwrap();
        assert!((0.49..0.51).contains(&cost), "{cost}");
    }

    #[tokio::test(start_paused = true)]
    async fn kill_is_not_recorded_during_cleanup() {
        let f = fixture(InMemoryProvisioner::new());
        launch(&f).await;
        f.store
            .write_atomic(|s| s.fail("boom", chrono::Utc::now()))
            .await
            .unwrap();
        f.store
            .write_atomic(|s| s.advance(RunStatus::Cleanup, "cleanup"))
            .await
            .unwrap();

        let report = f.killer.kill(&KillOptions::default()).await.unwrap();

        assert!(!report.recorded);
        assert_eq!(report.previous_status, RunStatus::Cleanup);
        assert!(report.terminated);
    }

    #[tokio::test]
    async fn nothing_to_kill() {
        let f = fixture(InMemoryProvisioner::new());
        let err = f.killer.kill(&KillOptions::default()).await.unwrap_err();
        assert!(matches!(err, RunError::StateNotFound));
    }
}
