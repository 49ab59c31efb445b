//! PhaseExecutor - worker 上で 4 つの phase を順に実行する状態機械
//!
//! # フロー
//! ```text
//! initialization -> data_sync -> training -> results_sync -> cleanup
//!        \              \            \              \
//!         +--------------+------------+--------------+--> failed | killed -> cleanup
//! ```
//!
//! # 学習ポイント
//! - phase ごとに「開始の書き込み」と「完了の書き込み」で挟む
//! - 開始の書き込みは最新の state を読むので、外部からの `killed` をここで検知できる
//! - phase の実行中は watchdog の watch channel と select! で競合させる
//! - 成否にかかわらず最後に必ず cleanup ブロックを通る（元のエラーはその後に返す）
//! - 再起動した worker は記録された phase から再開する。training.json は
//!   既存の記録にマージし、何も実行しなかった場合は書き換えない

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::app::artifacts::RunArtifacts;
use crate::app::cleanup::CleanupAgent;
use crate::app::retry::Retrier;
use crate::app::state_store::StateStore;
use crate::app::watchdog::{Watchdog, killed};
use crate::domain::record::{KILLED, completed_key, started_key};
use crate::domain::{
    CleanupReport, PhaseRecord, PhaseStatus, RunError, RunId, RunState, RunStatus, TrainingReport,
};
use crate::ports::{Clock, DataSync, HostProbe, Trainer};

/// Extensions recognised as model output.
const MODEL_EXTENSIONS: [&str; 3] = ["safetensors", "pkl", "pt"];

/// Worker-side settings.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub workdir: PathBuf,
    pub min_gpus: usize,
    pub sync_timeout: Duration,
    pub trainer_timeout: Duration,
    /// Watchdog limit on total run time. `None` disables it.
    pub max_run_duration: Option<Duration>,
    /// How often the watchdog re-reads the state for an external kill.
    pub state_poll: Duration,
}

impl WorkerOptions {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            min_gpus: 1,
            sync_timeout: Duration::from_secs(3600),
            trainer_timeout: Duration::from_secs(24 * 3600),
            max_run_duration: None,
            state_poll: Duration::from_secs(15),
        }
    }
}

/// Result of a run that reached cleanup without a failure.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub training: TrainingReport,
    pub cleanup: CleanupReport,
}

/// The worker's collaborators.
pub struct WorkerParts {
    pub trainer: Arc<dyn Trainer>,
    pub sync: Arc<dyn DataSync>,
    pub probe: Arc<dyn HostProbe>,
}

pub struct PhaseExecutor {
    store: StateStore,
    artifacts: RunArtifacts,
    cleanup: CleanupAgent,
    parts: WorkerParts,
    clock: Arc<dyn Clock>,
    retrier: Retrier,
    options: WorkerOptions,
}

/// Collects per-phase records for `training.json`.
struct PhaseLog {
    phases: BTreeMap<String, PhaseRecord>,
    started: Instant,
}

impl PhaseLog {
    fn new() -> Self {
        Self {
            phases: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    fn record(&mut self, phase: RunStatus, record: PhaseRecord) {
        self.phases.insert(phase.as_str().to_string(), record);
    }

    fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Build the report on top of an earlier worker's, if any. Phases run here
    /// replace earlier records; phases that never ran are reported as skipped.
    fn finish(
        self,
        run: &RunState,
        end: chrono::DateTime<chrono::Utc>,
        model_files: Vec<String>,
        previous: Option<TrainingReport>,
    ) -> TrainingReport {
        let (mut phases, carried_seconds, previous_models) = match previous {
            Some(p) => (p.phases, p.total_duration_seconds, p.model_files),
            None => (BTreeMap::new(), 0.0, Vec::new()),
        };
        phases.extend(self.phases);
        for phase in RunStatus::PHASES {
            phases
                .entry(phase.as_str().to_string())
                .or_insert(PhaseRecord {
                    status: PhaseStatus::Skipped,
                    duration_seconds: 0.0,
                    exit_code: None,
                    error: None,
                });
        }
        TrainingReport {
            run_id: run.run_id.clone(),
            phases,
            total_duration_seconds: carried_seconds + self.started.elapsed().as_secs_f64(),
            timestamp_start: run.started_at().unwrap_or(end),
            timestamp_end: end,
            model_files: if model_files.is_empty() {
                previous_models
            } else {
                model_files
            },
        }
    }
}

impl PhaseExecutor {
    pub fn new(
        store: StateStore,
        artifacts: RunArtifacts,
        cleanup: CleanupAgent,
        parts: WorkerParts,
        clock: Arc<dyn Clock>,
        retrier: Retrier,
        options: WorkerOptions,
    ) -> Self {
        let cleanup = cleanup.with_workdir(&options.workdir);
        Self {
            store,
            artifacts,
            cleanup,
            parts,
            clock,
            retrier,
            options,
        }
    }

    /// Drive `run_id` from its current status to cleanup.
    ///
    /// Cleanup always runs once the run's state has been read; on failure the
    /// original error is returned after it.
    pub async fn execute(&self, run_id: &RunId) -> Result<RunOutcome, RunError> {
        let state = self.store.read().await?;
        if state.run_id != *run_id {
            return Err(RunError::RunMismatch {
                expected: run_id.clone(),
                found: state.run_id,
            });
        }
        tracing::info!(run_id = %run_id, status = %state.status, "executor started");

        let watchdog = Watchdog::new(
            self.store.clone(),
            Arc::clone(&self.clock),
            run_id.clone(),
            state.started_at(),
            self.options.max_run_duration,
            self.options.state_poll,
        )
        .spawn();
        let mut kill_rx = watchdog.subscribe();

        let mut log = PhaseLog::new();
        let result = self.run_phases(&state, &mut log, &mut kill_rx).await;
        watchdog.stop();

        // guaranteed cleanup block
        let model_files = scan_model_files(&self.options.workdir).await;
        let training = self.settle_training_report(&state, log, model_files).await;
        if let Err(e) = &result {
            self.record_abort(run_id, e).await;
        }
        if let Err(e) = self
            .store
            .write_atomic(|s| s.advance(RunStatus::Cleanup, "cleanup"))
            .await
        {
            tracing::warn!(run_id = %run_id, error = %e, "could not move run to cleanup");
        }
        let cleanup = self.cleanup.cleanup(run_id, &state.instance_id).await;

        match result {
            Ok(()) => {
                tracing::info!(run_id = %run_id, "run succeeded");
                Ok(RunOutcome { training, cleanup })
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "run ended with error");
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        initial: &RunState,
        log: &mut PhaseLog,
        kill_rx: &mut watch::Receiver<Option<String>>,
    ) -> Result<(), RunError> {
        // an aborted run only needs its cleanup finished
        let message = initial.error_message.clone().unwrap_or_default();
        match initial.status {
            RunStatus::Killed => return Err(RunError::Killed(message)),
            RunStatus::Failed => return Err(RunError::PriorFailure(message)),
            RunStatus::Cleanup if initial.timestamp(KILLED).is_some() => {
                return Err(RunError::Killed(message));
            }
            RunStatus::Cleanup if initial.error_message.is_some() => {
                return Err(RunError::PriorFailure(message));
            }
            _ => {}
        }

        // a restarted worker resumes at the recorded phase
        let resume_at = initial.status.step_index();
        for phase in RunStatus::PHASES
            .into_iter()
            .filter(|p| p.step_index() >= resume_at)
        {
            let started = Instant::now();
            self.open_phase(phase).await?;

            let outcome = tokio::select! {
                biased;
                reason = killed(kill_rx) => Err(RunError::Killed(reason)),
                result = self.run_phase(phase, initial) => result,
            };
            let duration_seconds = started.elapsed().as_secs_f64();

            match outcome {
                Ok(exit_code) => {
                    log.record(
                        phase,
                        PhaseRecord {
                            status: PhaseStatus::Succeeded,
                            duration_seconds,
                            exit_code,
                            error: None,
                        },
                    );
                    self.close_phase(phase).await?;
                }
                Err(e) => {
                    tracing::error!(run_id = %initial.run_id, phase = %phase, error = %e, "phase failed");
                    log.record(
                        phase,
                        PhaseRecord {
                            status: if e.is_kill() {
                                PhaseStatus::Killed
                            } else {
                                PhaseStatus::Failed
                            },
                            duration_seconds,
                            exit_code: match &e {
                                RunError::TrainerExit(code) => Some(*code),
                                _ => None,
                            },
                            error: Some(e.to_string()),
                        },
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Opening bracket: status, step and `<phase>_started`. Stops on `killed`.
    async fn open_phase(&self, phase: RunStatus) -> Result<(), RunError> {
        let now = self.clock.now();
        self.store
            .write_atomic(|s| {
                if s.status == RunStatus::Killed {
                    return Err(RunError::Killed(
                        s.error_message.clone().unwrap_or_default(),
                    ));
                }
                s.advance(phase, phase_step(phase))?;
                s.mark(started_key(phase), now);
                Ok(())
            })
            .await?;
        tracing::info!(phase = %phase, "phase started");
        Ok(())
    }

    /// Closing bracket: `<phase>_completed`.
    async fn close_phase(&self, phase: RunStatus) -> Result<(), RunError> {
        let now = self.clock.now();
        self.store
            .write_atomic(|s| {
                if s.status == RunStatus::Killed {
                    return Err(RunError::Killed(
                        s.error_message.clone().unwrap_or_default(),
                    ));
                }
                s.mark(completed_key(phase), now);
                s.current_step = completed_key(phase);
                Ok(())
            })
            .await?;
        tracing::info!(phase = %phase, "phase completed");
        Ok(())
    }

    /// Do the phase's work. Returns the trainer exit code for the training phase.
    async fn run_phase(&self, phase: RunStatus, state: &RunState) -> Result<Option<i32>, RunError> {
        let workdir = self.options.workdir.as_path();
        let run_id = &state.run_id;
        let sync = &*self.parts.sync;
        match phase {
            RunStatus::Initialization => {
                self.preflight().await?;
                tokio::fs::create_dir_all(workdir).await?;
                Ok(None)
            }
            RunStatus::DataSync => {
                self.retrier
                    .run("sync_in", self.options.sync_timeout, || sync.sync_in(run_id, workdir))
                    .await?;
                Ok(None)
            }
            RunStatus::Training => {
                let limit = self.options.trainer_timeout;
                let code = tokio::time::timeout(
                    limit,
                    self.parts.trainer.run(&state.training_config, workdir),
                )
                .await
                .map_err(|_| RunError::Trainer(format!("training timed out after {limit:?}")))??;
                if code != 0 {
                    return Err(RunError::TrainerExit(code));
                }
                Ok(Some(code))
            }
            RunStatus::ResultsSync => {
                self.retrier
                    .run("sync_out", self.options.sync_timeout, || sync.sync_out(run_id, workdir))
                    .await?;
                Ok(None)
            }
            other => Err(RunError::InvalidState(format!("{other} is not a phase"))),
        }
    }

    /// Write `training.json`, merged with what an earlier worker recorded.
    ///
    /// When this worker ran no phase, an existing report is left untouched.
    async fn settle_training_report(
        &self,
        state: &RunState,
        log: PhaseLog,
        model_files: Vec<String>,
    ) -> TrainingReport {
        let run_id = &state.run_id;
        let previous = match self.artifacts.read_training(run_id).await {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "earlier training report unreadable");
                None
            }
        };
        let previous = match (log.is_empty(), previous) {
            (true, Some(previous)) => {
                tracing::info!(run_id = %run_id, "training report already written");
                return previous;
            }
            (_, previous) => previous,
        };

        let report = log.finish(state, self.clock.now(), model_files, previous);
        if let Err(e) = self.artifacts.write_training(&report).await {
            tracing::warn!(run_id = %run_id, error = %e, "could not write training report");
        }
        report
    }

    async fn preflight(&self) -> Result<(), RunError> {
        let report = self.parts.probe.probe().await?;
        let problems = report.problems(self.options.min_gpus);
        if !problems.is_empty() {
            return Err(RunError::Preflight(problems.join("; ")));
        }
        tracing::info!(gpus = report.gpu_count(), "host preflight passed");
        Ok(())
    }

    /// Record `failed` (or `killed` if only the signal got through) unless the
    /// run already left the phase loop.
    async fn record_abort(&self, run_id: &RunId, err: &RunError) {
        let now = self.clock.now();
        let message = match err {
            RunError::Killed(reason) => reason.clone(),
            other => other.to_string(),
        };
        let result = self
            .store
            .write_atomic(|s| {
                if !s.status.is_active() {
                    return Err(RunError::InvalidTransition {
                        from: s.status,
                        to: RunStatus::Failed,
                    });
                }
                if err.is_kill() {
                    s.kill(message, now)
                } else {
                    s.fail(message, now)
                }
            })
            .await;
        match result {
            Ok(state) => tracing::info!(run_id = %run_id, status = %state.status, "abort recorded"),
            Err(e) => tracing::debug!(run_id = %run_id, error = %e, "abort not recorded"),
        }
    }
}

fn phase_step(phase: RunStatus) -> &'static str {
    match phase {
        RunStatus::Initialization => "preflight",
        RunStatus::DataSync => "sync_in",
        RunStatus::Training => "training",
        RunStatus::ResultsSync => "sync_out",
        other => other.as_str(),
    }
}

/// Model files under `root`, as sorted relative paths.
async fn scan_model_files(root: &Path) -> Vec<String> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(t) if t.is_dir() => pending.push(path),
                Ok(_) => {
                    let is_model = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| MODEL_EXTENSIONS.contains(&e));
                    if is_model && let Ok(relative) = path.strip_prefix(root) {
                        found.push(relative.display().to_string());
                    }
                }
                Err(_) => {}
            }
        }
    }
    found.sort();
    found
}
