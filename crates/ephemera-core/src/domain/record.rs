//! Run record: the single shared-state document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::RunError;
use super::ids::{InstanceId, RunId};
use super::state::RunStatus;

/// Timestamp key written by the launcher.
pub const START: &str = "start";

/// Timestamp key written when a kill is recorded.
pub const KILLED: &str = "killed";

/// Timestamp key written when a failure is recorded.
pub const FAILED: &str = "failed";

/// `<phase>_started` key for the opening write of a phase bracket.
pub fn started_key(phase: RunStatus) -> String {
    format!("{}_started", phase.as_str())
}

/// `<phase>_completed` key for the closing write of a phase bracket.
pub fn completed_key(phase: RunStatus) -> String {
    format!("{}_completed", phase.as_str())
}

/// The RunState document stored at `{env}/system-state.json`.
///
/// Design:
/// - This is the "single source of truth" shared by controller and worker.
/// - Its existence is the lock meaning "a run is active".
/// - Every write replaces the whole document; see `StateStore::write_atomic`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub status: RunStatus,

    /// Advisory sub-phase label (e.g. "epoch_5").
    #[serde(default)]
    pub current_step: String,

    pub instance_id: InstanceId,

    /// Named events. Append-only: a key is never rewritten once it holds a time.
    #[serde(default)]
    pub timestamps: BTreeMap<String, Option<DateTime<Utc>>>,

    /// Opaque passthrough handed to the trainer.
    #[serde(default)]
    pub training_config: serde_json::Value,

    #[serde(default)]
    pub error_message: Option<String>,

    /// Time of the most recent write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// Initial document written by the launcher.
    pub fn new(
        run_id: RunId,
        instance_id: InstanceId,
        training_config: serde_json::Value,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut timestamps = BTreeMap::new();
        timestamps.insert(START.to_string(), Some(started_at));
        Self {
            run_id,
            status: RunStatus::Initialization,
            current_step: "launched".to_string(),
            instance_id,
            timestamps,
            training_config,
            error_message: None,
            updated_at: Some(started_at),
        }
    }

    /// Record a named event. Returns false (and changes nothing) if it was already set.
    pub fn mark(&mut self, key: impl Into<String>, at: DateTime<Utc>) -> bool {
        let slot = self.timestamps.entry(key.into()).or_insert(None);
        if slot.is_some() {
            return false;
        }
        *slot = Some(at);
        true
    }

    pub fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.timestamps.get(key).copied().flatten()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp(START)
    }

    /// Wall-clock time since launch.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.started_at().map(|start| now - start)
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn advance(&mut self, next: RunStatus, step: impl Into<String>) -> Result<(), RunError> {
        if !self.status.can_transition_to(next) {
            return Err(RunError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.current_step = step.into();
        Ok(())
    }

    /// Record a terminal failure.
    pub fn fail(&mut self, message: impl Into<String>, at: DateTime<Utc>) -> Result<(), RunError> {
        let step = format!("{}_error", self.status);
        self.advance(RunStatus::Failed, step)?;
        self.error_message = Some(message.into());
        self.mark(FAILED, at);
        Ok(())
    }

    /// Record a kill with the operator- or watchdog-supplied reason.
    pub fn kill(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> Result<(), RunError> {
        self.advance(RunStatus::Killed, "killed")?;
        self.error_message = Some(reason.into());
        self.mark(KILLED, at);
        Ok(())
    }

    /// Schema checks run before every write.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.run_id.is_blank() {
            return Err(RunError::InvalidState("run_id is required".to_string()));
        }
        if self.instance_id.is_blank() {
            return Err(RunError::InvalidState("instance_id is required".to_string()));
        }
        if self.started_at().is_none() {
            return Err(RunError::InvalidState(
                "timestamps.start is required".to_string(),
            ));
        }
        if self.status.is_aborted() && self.error_message.is_none() {
            return Err(RunError::InvalidState(format!(
                "status={} requires error_message",
                self.status
            )));
        }
        Ok(())
    }

    /// Checks that `self` is a legal successor of `previous`.
    pub fn validate_successor_of(&self, previous: &RunState) -> Result<(), RunError> {
        if self.run_id != previous.run_id {
            return Err(RunError::InvalidState("run_id is immutable".to_string()));
        }
        if self.instance_id != previous.instance_id {
            return Err(RunError::InvalidState(
                "instance_id is immutable".to_string(),
            ));
        }
        if !previous.status.can_transition_to(self.status) {
            return Err(RunError::InvalidTransition {
                from: previous.status,
                to: self.status,
            });
        }
        for (key, at) in &previous.timestamps {
            if at.is_some() && self.timestamps.get(key) != Some(at) {
                return Err(RunError::InvalidState(format!(
                    "timestamps.{key} is append-only"
                )));
            }
        }
        Ok(())
    }
}
