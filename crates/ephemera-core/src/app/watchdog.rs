//! Watchdog - executor と並走する kill 検知タスク
//!
//! - 最大実行時間を超えたら `killed` を書き込む（write_atomic 経由）。
//!   期限は launch 時刻（`timestamps.start`）から数えるので、worker を
//!   再起動しても延びない
//! - Killer が外から書いた `killed` をポーリングで検知する
//!
//! どちらの場合も watch channel で executor に理由を伝えます。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::app::state_store::StateStore;
use crate::domain::{RunError, RunId, RunStatus};
use crate::ports::Clock;

pub struct Watchdog {
    store: StateStore,
    clock: Arc<dyn Clock>,
    run_id: RunId,
    started_at: Option<DateTime<Utc>>,
    max_duration: Option<Duration>,
    poll_interval: Duration,
}

/// Running watchdog. Dropping it stops the task.
pub struct WatchdogHandle {
    kill_rx: watch::Receiver<Option<String>>,
    task: JoinHandle<()>,
}

impl WatchdogHandle {
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.kill_rx.clone()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Resolves with the kill reason once one is signalled; never resolves otherwise.
pub async fn killed(rx: &mut watch::Receiver<Option<String>>) -> String {
    let reason = rx
        .wait_for(Option::is_some)
        .await
        .map(|reason| (*reason).clone().unwrap_or_default());
    match reason {
        Ok(reason) => reason,
        Err(_) => std::future::pending().await,
    }
}

impl Watchdog {
    pub fn new(
        store: StateStore,
        clock: Arc<dyn Clock>,
        run_id: RunId,
        started_at: Option<DateTime<Utc>>,
        max_duration: Option<Duration>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            run_id,
            started_at,
            max_duration,
            poll_interval,
        }
    }

    /// Time left before the limit, counted from the run's start. Zero once overdue.
    fn remaining(&self) -> Option<Duration> {
        let limit = self.max_duration?;
        let elapsed = self
            .started_at
            .and_then(|start| (self.clock.now() - start).to_std().ok())
            .unwrap_or_default();
        Some(limit.saturating_sub(elapsed))
    }

    pub fn spawn(self) -> WatchdogHandle {
        let (tx, kill_rx) = watch::channel(None);
        let task = tokio::spawn(self.run(tx));
        WatchdogHandle { kill_rx, task }
    }

    async fn run(self, tx: watch::Sender<Option<String>>) {
        let max_duration = self.max_duration;
        let remaining = self.remaining();
        let expiry = async move {
            match remaining {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                _ = &mut expiry => {
                    let reason = format!(
                        "max run duration of {}s exceeded",
                        max_duration.map(|d| d.as_secs()).unwrap_or_default()
                    );
                    self.force_kill(&reason).await;
                    let _ = tx.send(Some(reason));
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Some(reason) = self.external_kill().await {
                        tracing::warn!(run_id = %self.run_id, reason = %reason, "kill observed");
                        let _ = tx.send(Some(reason));
                        return;
                    }
                }
            }
        }
    }

    async fn force_kill(&self, reason: &str) {
        tracing::warn!(run_id = %self.run_id, reason, "watchdog killing run");
        let now = self.clock.now();
        let result = self
            .store
            .write_atomic(|s| {
                if s.run_id != self.run_id {
                    return Err(RunError::RunMismatch {
                        expected: self.run_id.clone(),
                        found: s.run_id.clone(),
                    });
                }
                s.kill(reason, now)
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(run_id = %self.run_id, error = %e, "could not record watchdog kill");
        }
    }

    async fn external_kill(&self) -> Option<String> {
        match self.store.try_read().await {
            Ok(Some(state)) if state.run_id == self.run_id && state.status == RunStatus::Killed => {
                Some(state.error_message.unwrap_or_else(|| "killed".to_string()))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(run_id = %self.run_id, error = %e, "watchdog poll failed");
                None
            }
        }
    }
}
