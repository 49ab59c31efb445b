//! End-to-end run lifecycle on the in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use ephemera_core::app::{App, AppBuilder, LaunchRequest, StateStore, WorkerOptions, WorkerParts};
use ephemera_core::domain::{
    ManagedResource, PhaseStatus, ResourceStatus, RunError, RunState, RunStatus,
};
use ephemera_core::impls::{
    BlobOp, Fault, InMemoryBlobStore, InMemoryProvisioner, ScriptedSync, ScriptedTrainer,
    StaticProbe,
};
use ephemera_core::ports::{ComputeProfile, InstanceState};
use tempfile::TempDir;

struct Harness {
    blob: InMemoryBlobStore,
    compute: InMemoryProvisioner,
    app: App,
    dir: TempDir,
}

fn harness() -> Harness {
    let blob = InMemoryBlobStore::new();
    let compute = InMemoryProvisioner::new().with_volumes(1);
    let app = AppBuilder::new()
        .environment("dev")
        .blob_store(Arc::new(blob.clone()))
        .compute(Arc::new(compute.clone()))
        .build()
        .unwrap();
    Harness {
        blob,
        compute,
        app,
        dir: tempfile::tempdir().unwrap(),
    }
}

impl Harness {
    async fn launch(&self) -> RunState {
        self.app
            .launcher()
            .launch(LaunchRequest {
                profile: ComputeProfile::new("g5.xlarge"),
                training_config: serde_json::json!({"epochs": 3}),
            })
            .await
            .unwrap()
    }

    fn options(&self) -> WorkerOptions {
        let mut options = WorkerOptions::new(self.dir.path().join("run"));
        options.state_poll = Duration::from_secs(1);
        options
    }
}

fn parts(trainer: Arc<ScriptedTrainer>, sync: Arc<ScriptedSync>) -> WorkerParts {
    WorkerParts {
        trainer,
        sync,
        probe: Arc::new(StaticProbe::gpus(1)),
    }
}

#[tokio::test]
async fn successful_run_leaves_only_reports() {
    let h = harness();
    let state = h.launch().await;
    let trainer = Arc::new(ScriptedTrainer::new(0).producing("model.safetensors"));
    let sync = Arc::new(ScriptedSync::ok());

    let outcome = h
        .app
        .executor(parts(trainer.clone(), sync.clone()), h.options())
        .execute(&state.run_id)
        .await
        .unwrap();

    assert_eq!(trainer.calls(), 1);
    assert_eq!((sync.calls_in(), sync.calls_out()), (1, 1));
    assert!(outcome.training.succeeded());
    assert_eq!(outcome.training.model_files, vec!["model/model.safetensors"]);
    assert_eq!(outcome.training.phases["training"].exit_code, Some(0));
    assert!(!outcome.cleanup.manual_action_required);

    // instance, volume, state and workdir are gone; the reports stay
    assert!(h.app.store().try_read().await.unwrap().is_none());
    assert_eq!(h.compute.running_count().await, 0);
    assert_eq!(h.compute.storage_count().await, 0);
    assert!(!h.dir.path().join("run").exists());
    let saved = h.app.artifacts().read_training(&state.run_id).await.unwrap().unwrap();
    assert_eq!(saved, outcome.training);
    let cleanup = h.app.artifacts().read_cleanup(&state.run_id).await.unwrap().unwrap();
    assert_eq!(
        cleanup.status_of(ManagedResource::ComputeInstance),
        Some(ResourceStatus::Deleted)
    );
    assert_eq!(
        cleanup.status_of(ManagedResource::EphemeralStorage),
        Some(ResourceStatus::Deleted)
    );
}

/// Poll the state until it disappears, recording each status change.
async fn observe_statuses(store: StateStore, first: RunState) -> Vec<RunState> {
    let mut seen = vec![first];
    while let Some(current) = store.try_read().await.unwrap() {
        if seen.last().is_none_or(|last| last.status != current.status) {
            seen.push(current);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn trainer_failure_is_recorded_and_cleaned_up() {
    let h = harness();
    let state = h.launch().await;
    let launched = h.app.store().read().await.unwrap();
    assert_eq!(launched.status, RunStatus::Initialization);
    let trainer = Arc::new(ScriptedTrainer::new(1).taking(Duration::from_secs(60)));
    let sync = Arc::new(ScriptedSync::ok());

    let reader = tokio::spawn(observe_statuses(h.app.store().clone(), launched));
    let err = h
        .app
        .executor(parts(trainer, sync.clone()), h.options())
        .execute(&state.run_id)
        .await
        .unwrap_err();
    let seen = reader.await.unwrap();

    assert!(matches!(err, RunError::TrainerExit(1)));
    let statuses: Vec<RunStatus> = seen.iter().map(|s| s.status).collect();
    assert_eq!(statuses.first(), Some(&RunStatus::Initialization), "{statuses:?}");
    assert!(
        statuses.windows(2).all(|w| w[0].step_index() <= w[1].step_index()),
        "{statuses:?}"
    );
    let training = seen
        .iter()
        .find(|s| s.status == RunStatus::Training)
        .expect("training observed");
    assert!(training.timestamp("data_sync_completed").is_some());
    assert!(training.timestamp("training_started").is_some());
    // results are not synced after a failed training
    assert_eq!(sync.calls_out(), 0);

    let training = h.app.artifacts().read_training(&state.run_id).await.unwrap().unwrap();
    assert!(!training.succeeded());
    assert_eq!(training.phases["training"].status, PhaseStatus::Failed);
    assert_eq!(training.phases["training"].exit_code, Some(1));
    assert_eq!(training.phases["results_sync"].status, PhaseStatus::Skipped);

    let cleanup = h.app.artifacts().read_cleanup(&state.run_id).await.unwrap().unwrap();
    assert_eq!(
        cleanup.status_of(ManagedResource::ComputeInstance),
        Some(ResourceStatus::Deleted)
    );
    assert!(!cleanup.manual_action_required);
    assert!(h.app.store().try_read().await.unwrap().is_none());
    assert_eq!(
        h.compute.state_of(&state.instance_id).await,
        Some(InstanceState::Terminated)
    );
}

#[tokio::test]
async fn failure_record_survives_when_state_cannot_be_deleted() {
    let h = harness();
    let state = h.launch().await;
    // temp object and state object deletes are both refused
    h.blob.fail_next(BlobOp::Delete, 2, Fault::Denied).await;

    let err = h
        .app
        .executor(
            parts(Arc::new(ScriptedTrainer::new(1)), Arc::new(ScriptedSync::ok())),
            h.options(),
        )
        .execute(&state.run_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::TrainerExit(1)));

    let left = h.app.store().read().await.unwrap();
    assert_eq!(left.status, RunStatus::Cleanup);
    assert_eq!(left.error_message.as_deref(), Some("trainer exited with code 1"));
    assert!(left.timestamp("failed").is_some());
    assert!(left.timestamp("training_started").is_some());
    assert!(left.timestamp("training_completed").is_none());

    // a second cleanup finishes the job
    let report = h.app.cleanup_agent().cleanup(&left.run_id, &left.instance_id).await;
    assert_eq!(
        report.status_of(ManagedResource::ComputeInstance),
        Some(ResourceStatus::NotFound)
    );
    assert_eq!(
        report.status_of(ManagedResource::StateObject),
        Some(ResourceStatus::Deleted)
    );
    assert!(h.app.store().try_read().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn kill_interrupts_training() {
    let h = harness();
    let state = h.launch().await;
    let trainer = Arc::new(ScriptedTrainer::new(0).taking(Duration::from_secs(3600)));
    let sync = Arc::new(ScriptedSync::ok());
    let executor = h.app.executor(parts(trainer, sync.clone()), h.options());

    let run_id = state.run_id.clone();
    let worker = tokio::spawn(async move { executor.execute(&run_id).await });

    // wait until training is underway
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let current = h.app.store().read().await.unwrap();
        if current.status == RunStatus::Training {
            break;
        }
    }
    h.app
        .store()
        .write_atomic(|s| s.kill("stopped by operator", chrono::Utc::now()))
        .await
        .unwrap();

    let err = worker.await.unwrap().unwrap_err();
    assert!(matches!(err, RunError::Killed(ref reason) if reason == "stopped by operator"));
    assert_eq!(sync.calls_out(), 0);

    let training = h.app.artifacts().read_training(&state.run_id).await.unwrap().unwrap();
    assert_eq!(training.phases["training"].status, PhaseStatus::Killed);
    assert_eq!(training.phases["data_sync"].status, PhaseStatus::Succeeded);
    assert!(h.app.store().try_read().await.unwrap().is_none());
    assert_eq!(h.compute.running_count().await, 0);
}

#[tokio::test]
async fn second_launch_is_refused_while_a_run_is_active() {
    let h = harness();
    let first = h.launch().await;

    let err = h
        .app
        .launcher()
        .launch(LaunchRequest {
            profile: ComputeProfile::new("g5.xlarge"),
            training_config: serde_json::json!({}),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::AlreadyActive { ref run_id } if *run_id == first.run_id));
    assert_eq!(h.compute.running_count().await, 1);
}

#[tokio::test]
async fn status_never_moves_backwards() {
    let h = harness();
    h.launch().await;
    let store = h.app.store();
    store
        .write_atomic(|s| s.advance(RunStatus::DataSync, "sync_in"))
        .await
        .unwrap();
    store
        .write_atomic(|s| s.advance(RunStatus::Training, "training"))
        .await
        .unwrap();

    let err = store
        .write_atomic(|s| {
            s.status = RunStatus::DataSync;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::InvalidTransition {
            from: RunStatus::Training,
            to: RunStatus::DataSync
        }
    ));
    assert_eq!(store.read().await.unwrap().status, RunStatus::Training);
}
