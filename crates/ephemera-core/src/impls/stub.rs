//! Scripted stand-ins for the worker's collaborators (dev/test).

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{RunError, RunId};
use crate::ports::{DataSync, HostProbe, HostReport, Trainer};

/// Trainer that sleeps, drops model files into the workdir and exits with a
/// fixed code.
#[derive(Debug, Default)]
pub struct ScriptedTrainer {
    exit_code: i32,
    duration: Duration,
    model_files: Vec<String>,
    calls: AtomicU32,
}

impl ScriptedTrainer {
    pub fn new(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    pub fn taking(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn producing(mut self, file: impl Into<String>) -> Self {
        self.model_files.push(file.into());
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Trainer for ScriptedTrainer {
    async fn run(&self, _config: &serde_json::Value, workdir: &Path) -> Result<i32, RunError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.duration.is_zero() {
            tokio::time::sleep(self.duration).await;
        }
        if !self.model_files.is_empty() {
            let model_dir = workdir.join("model");
            tokio::fs::create_dir_all(&model_dir).await?;
            for name in &self.model_files {
                tokio::fs::write(model_dir.join(name), b"weights").await?;
            }
        }
        Ok(self.exit_code)
    }
}

/// DataSync that fails a configured number of times per direction.
#[derive(Debug, Default)]
pub struct ScriptedSync {
    fail_in: AtomicU32,
    fail_out: AtomicU32,
    transient: bool,
    calls_in: AtomicU32,
    calls_out: AtomicU32,
}

impl ScriptedSync {
    /// Always succeeds.
    pub fn ok() -> Self {
        Self::default()
    }

    /// First `times` sync-in calls fail.
    pub fn failing_in(times: u32, transient: bool) -> Self {
        Self {
            fail_in: AtomicU32::new(times),
            transient,
            ..Self::default()
        }
    }

    /// First `times` sync-out calls fail.
    pub fn failing_out(times: u32, transient: bool) -> Self {
        Self {
            fail_out: AtomicU32::new(times),
            transient,
            ..Self::default()
        }
    }

    pub fn calls_in(&self) -> u32 {
        self.calls_in.load(Ordering::SeqCst)
    }

    pub fn calls_out(&self) -> u32 {
        self.calls_out.load(Ordering::SeqCst)
    }

    fn step(&self, remaining: &AtomicU32, direction: &str) -> Result<(), RunError> {
        let failed = remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(RunError::Sync {
                message: format!("scripted {direction} failure"),
                transient: self.transient,
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DataSync for ScriptedSync {
    async fn sync_in(&self, _run_id: &RunId, _workdir: &Path) -> Result<(), RunError> {
        self.calls_in.fetch_add(1, Ordering::SeqCst);
        self.step(&self.fail_in, "sync_in")
    }

    async fn sync_out(&self, _run_id: &RunId, _workdir: &Path) -> Result<(), RunError> {
        self.calls_out.fetch_add(1, Ordering::SeqCst);
        self.step(&self.fail_out, "sync_out")
    }
}

/// HostProbe returning a fixed report.
#[derive(Debug, Clone)]
pub struct StaticProbe(pub HostReport);

impl StaticProbe {
    pub fn gpus(count: usize) -> Self {
        Self(HostReport {
            driver_loaded: count > 0,
            gpu_names: (0..count).map(|_| "Fake GPU".to_string()).collect(),
        })
    }
}

#[async_trait]
impl HostProbe for StaticProbe {
    async fn probe(&self) -> Result<HostReport, RunError> {
        Ok(self.0.clone())
    }
}
