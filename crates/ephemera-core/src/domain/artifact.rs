//! Run artifacts: the durable record of what happened.
//!
//! Both documents are keyed by `run_id` and outlive the RunState object.
//! - `training.json`: per-phase outcome log written by the executor.
//! - `cleanup_status.json`: per-resource teardown outcome written by CleanupAgent.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{InstanceId, RunId};

pub const TRAINING_REPORT: &str = "training.json";
pub const CLEANUP_REPORT: &str = "cleanup_status.json";

/// How a single phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Succeeded,
    Failed,
    Killed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    pub duration_seconds: f64,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `training.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub run_id: RunId,
    pub phases: BTreeMap<String, PhaseRecord>,
    pub total_duration_seconds: f64,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: DateTime<Utc>,

    /// Model files found in the workdir after training (relative paths).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub model_files: Vec<String>,
}

impl TrainingReport {
    /// Did every recorded phase succeed?
    pub fn succeeded(&self) -> bool {
        !self.phases.is_empty()
            && self
                .phases
                .values()
                .all(|p| p.status == PhaseStatus::Succeeded)
    }
}

/// Resources CleanupAgent manages for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagedResource {
    ComputeInstance,
    EphemeralStorage,
    StateTempObject,
    Workdir,
    StateObject,
}

impl ManagedResource {
    pub fn name(self) -> &'static str {
        match self {
            ManagedResource::ComputeInstance => "compute_instance",
            ManagedResource::EphemeralStorage => "ephemeral_storage",
            ManagedResource::StateTempObject => "state_temp_object",
            ManagedResource::Workdir => "workdir",
            ManagedResource::StateObject => "state_object",
        }
    }

    /// Leaving one of these behind keeps costing money.
    pub fn is_cost_bearing(self) -> bool {
        matches!(
            self,
            ManagedResource::ComputeInstance | ManagedResource::EphemeralStorage
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Deleted,
    NotFound,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceOutcome {
    pub status: ResourceStatus,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ResourceOutcome {
    pub fn deleted(at: DateTime<Utc>) -> Self {
        Self {
            status: ResourceStatus::Deleted,
            error: None,
            timestamp: at,
        }
    }

    pub fn not_found(at: DateTime<Utc>) -> Self {
        Self {
            status: ResourceStatus::NotFound,
            error: None,
            timestamp: at,
        }
    }

    pub fn failed(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: ResourceStatus::Failed,
            error: Some(error.into()),
            timestamp: at,
        }
    }
}

/// `cleanup_status.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub run_id: RunId,
    pub instance_id: InstanceId,
    pub resources: BTreeMap<String, ResourceOutcome>,
    pub manual_action_required: bool,

    /// Outcome of deleting the RunState itself. That deletion happens after the
    /// report is persisted, so it only lives on the in-memory value.
    #[serde(skip)]
    pub state_object: Option<ResourceOutcome>,
}

impl CleanupReport {
    pub fn new(run_id: RunId, instance_id: InstanceId) -> Self {
        Self {
            run_id,
            instance_id,
            resources: BTreeMap::new(),
            manual_action_required: false,
            state_object: None,
        }
    }

    /// Record one resource outcome and keep the aggregate flag in sync.
    pub fn record(&mut self, resource: ManagedResource, outcome: ResourceOutcome) {
        if resource.is_cost_bearing() && outcome.status == ResourceStatus::Failed {
            self.manual_action_required = true;
        }
        if resource == ManagedResource::StateObject {
            self.state_object = Some(outcome);
        } else {
            self.resources.insert(resource.name().to_string(), outcome);
        }
    }

    pub fn status_of(&self, resource: ManagedResource) -> Option<ResourceStatus> {
        if resource == ManagedResource::StateObject {
            return self.state_object.as_ref().map(|o| o.status);
        }
        self.resources.get(resource.name()).map(|o| o.status)
    }

    /// Fold a later cleanup attempt into this earlier report.
    ///
    /// A resource's first `deleted` or `not_found` outcome stands; a `failed`
    /// outcome is replaced by the later one. `manual_action_required` never
    /// goes back to false.
    pub fn absorb(&mut self, later: &CleanupReport) {
        for (name, outcome) in &later.resources {
            let settled = self
                .resources
                .get(name)
                .is_some_and(|o| o.status != ResourceStatus::Failed);
            if !settled {
                self.resources.insert(name.clone(), outcome.clone());
            }
        }
        self.manual_action_required |= later.manual_action_required;
    }

    pub fn has_failures(&self) -> bool {
        self.resources
            .values()
            .chain(self.state_object.iter())
            .any(|o| o.status == ResourceStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn cosmetic_failures_do_not_require_manual_action() {
        let mut report = CleanupReport::new(RunId::new("R1"), InstanceId::new("i-1"));
        report.record(ManagedResource::ComputeInstance, ResourceOutcome::deleted(now()));
        report.record(ManagedResource::Workdir, ResourceOutcome::failed("EBUSY", now()));

        assert!(!report.manual_action_required);
        assert!(report.has_failures());
    }

    #[test]
    fn cost_bearing_failure_requires_manual_action() {
        let mut report = CleanupReport::new(RunId::new("R1"), InstanceId::new("i-1"));
        report.record(
            ManagedResource::EphemeralStorage,
            ResourceOutcome::failed("volume in use", now()),
        );
        assert!(report.manual_action_required);
    }

    #[test]
    fn cleanup_report_wire_shape() {
        let mut report = CleanupReport::new(RunId::new("R1"), InstanceId::new("i-1"));
        report.record(ManagedResource::ComputeInstance, ResourceOutcome::deleted(now()));
        report.record(ManagedResource::StateObject, ResourceOutcome::deleted(now()));

        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["resources"]["compute_instance"]["status"], "deleted");
        assert_eq!(v["manual_action_required"], false);
        assert!(v.get("state_object").is_none());
        assert_eq!(
            report.status_of(ManagedResource::StateObject),
            Some(ResourceStatus::Deleted)
        );
    }

    #[test]
    fn later_attempt_only_replaces_failures() {
        let t0 = now();
        let mut first = CleanupReport::new(RunId::new("R1"), InstanceId::new("i-1"));
        first.record(ManagedResource::ComputeInstance, ResourceOutcome::deleted(t0));
        first.record(
            ManagedResource::EphemeralStorage,
            ResourceOutcome::failed("VolumeInUse", t0),
        );
        assert!(first.manual_action_required);

        let mut second = CleanupReport::new(RunId::new("R1"), InstanceId::new("i-1"));
        second.record(ManagedResource::ComputeInstance, ResourceOutcome::not_found(now()));
        second.record(ManagedResource::EphemeralStorage, ResourceOutcome::deleted(now()));
        second.record(ManagedResource::StateTempObject, ResourceOutcome::not_found(now()));

        first.absorb(&second);
        assert_eq!(first.resources["compute_instance"], ResourceOutcome::deleted(t0));
        assert_eq!(
            first.status_of(ManagedResource::EphemeralStorage),
            Some(ResourceStatus::Deleted)
        );
        assert_eq!(
            first.status_of(ManagedResource::StateTempObject),
            Some(ResourceStatus::NotFound)
        );
        assert!(first.manual_action_required);
    }

    #[test]
    fn training_report_success_requires_all_phases() {
        let mut phases = BTreeMap::new();
        phases.insert(
            "training".to_string(),
            PhaseRecord {
                status: PhaseStatus::Failed,
                duration_seconds: 1.0,
                exit_code: Some(1),
                error: Some("trainer exited with code 1".to_string()),
            },
        );
        let report = TrainingReport {
            run_id: RunId::new("R1"),
            phases,
            total_duration_seconds: 1.0,
            timestamp_start: now(),
            timestamp_end: now(),
            model_files: vec![],
        };
        assert!(!report.succeeded());
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["phases"]["training"]["exit_code"], 1);
    }
}
