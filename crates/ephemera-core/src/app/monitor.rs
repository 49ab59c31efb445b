//! Monitor - 読み取り専用のポーリング
//!
//! state が無いとき、それが「まだ始まっていない」のか「終わって消えた」のかは
//! 直前に見た run_id を覚えているかどうかで区別します。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::app::artifacts::RunArtifacts;
use crate::app::state_store::StateStore;
use crate::domain::{CleanupReport, RunError, RunId, RunState, RunStatus};
use crate::ports::Clock;

/// What an operator sees for an active run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunView {
    pub run_id: RunId,
    pub status: RunStatus,
    pub current_step: String,
    pub elapsed: Option<Duration>,
    pub error_message: Option<String>,
}

impl RunView {
    pub fn from_state(state: &RunState, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            run_id: state.run_id.clone(),
            status: state.status,
            current_step: state.current_step.clone(),
            elapsed: state.elapsed(now).and_then(|d| d.to_std().ok()),
            error_message: state.error_message.clone(),
        }
    }
}

/// `HH:MM:SS`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

impl fmt::Display for RunView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] run={} step={}", self.status, self.run_id, self.current_step)?;
        if let Some(elapsed) = self.elapsed {
            write!(f, " elapsed={}", format_elapsed(elapsed))?;
        }
        if let Some(msg) = &self.error_message {
            write!(f, " error={msg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// No state, and none seen before.
    NotStarted,
    Active(RunView),
    /// The state of a run seen earlier is gone.
    Finished {
        run_id: RunId,
        cleanup: Option<CleanupReport>,
    },
}

impl MonitorEvent {
    /// Should a watching operator stop here?
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MonitorEvent::Active(_))
    }
}

pub struct Monitor {
    store: StateStore,
    artifacts: RunArtifacts,
    clock: Arc<dyn Clock>,
    interval: Duration,
    last_seen: Option<RunId>,
}

impl Monitor {
    pub fn new(
        store: StateStore,
        artifacts: RunArtifacts,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            artifacts,
            clock,
            interval,
            last_seen: None,
        }
    }

    pub async fn poll_once(&mut self) -> Result<MonitorEvent, RunError> {
        match self.store.try_read().await? {
            Some(state) => {
                self.last_seen = Some(state.run_id.clone());
                Ok(MonitorEvent::Active(RunView::from_state(&state, self.clock.now())))
            }
            None => match &self.last_seen {
                None => Ok(MonitorEvent::NotStarted),
                Some(run_id) => {
                    let cleanup = match self.artifacts.read_cleanup(run_id).await {
                        Ok(report) => report,
                        Err(e) => {
                            tracing::warn!(run_id = %run_id, error = %e, "could not load cleanup report");
                            None
                        }
                    };
                    Ok(MonitorEvent::Finished {
                        run_id: run_id.clone(),
                        cleanup,
                    })
                }
            },
        }
    }

    /// Poll at the configured interval until the run finishes (or was never
    /// started), handing every event to `on_event`.
    pub async fn run<F>(&mut self, mut on_event: F) -> Result<MonitorEvent, RunError>
    where
        F: FnMut(&MonitorEvent),
    {
        loop {
            let event = self.poll_once().await?;
            on_event(&event);
            if event.is_terminal() {
                return Ok(event);
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::retry::Retrier;
    use crate::domain::InstanceId;
    use crate::impls::InMemoryBlobStore;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    fn monitor() -> (StateStore, Monitor) {
        let blob = Arc::new(InMemoryBlobStore::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 13, 1, 5).unwrap(),
        ));
        let store = StateStore::new(blob.clone(), clock.clone(), Retrier::default(), "dev", Duration::from_secs(30));
        let artifacts = RunArtifacts::new(blob, Retrier::default(), "dev", Duration::from_secs(30));
        let monitor = Monitor::new(store.clone(), artifacts, clock, Duration::from_secs(30));
        (store, monitor)
    }

    fn state() -> RunState {
        RunState::new(
            RunId::new("R1"),
            InstanceId::new("i-1"),
            serde_json::json!({}),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn absent_state_is_disambiguated_by_memory() {
        let (store, mut monitor) = monitor();
        assert_eq!(monitor.poll_once().await.unwrap(), MonitorEvent::NotStarted);

        store.create(&state()).await.unwrap();
        let MonitorEvent::Active(view) = monitor.poll_once().await.unwrap() else {
            panic!("expected active run");
        };
        assert_eq!(view.to_string(), "[initialization] run=R1 step=launched elapsed=01:01:05");

        store.delete(&RunId::new("R1")).await.unwrap();
        assert_eq!(
            monitor.poll_once().await.unwrap(),
            MonitorEvent::Finished {
                run_id: RunId::new("R1"),
                cleanup: None
            }
        );
    }

    #[test]
    fn failed_view_shows_error_verbatim() {
        let mut s = state();
        s.fail("trainer exited with code 1", Utc::now()).unwrap();
        let view = RunView::from_state(&s, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 9).unwrap());
        assert_eq!(
            view.to_string(),
            "[failed] run=R1 step=initialization_error elapsed=00:00:09 error=trainer exited with code 1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_when_nothing_is_active() {
        let (_store, mut monitor) = monitor();
        let mut seen = 0;
        let last = monitor.run(|_| seen += 1).await.unwrap();
        assert_eq!(last, MonitorEvent::NotStarted);
        assert_eq!(seen, 1);
    }
}
