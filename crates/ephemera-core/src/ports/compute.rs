//! ComputeProvisioner port - ephemeral GPU instance の作成・停止・観測
//!
//! インフラ（VPC, IAM, bucket）は事前にデプロイ済みであることが前提です。
//! ここでは run ごとに作って捨てる課金リソースだけを扱います。

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{InstanceId, RunId};

/// Desired compute profile (from config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeProfile {
    pub instance_type: String,

    #[serde(default)]
    pub image_id: Option<String>,

    /// Pre-deployed launch template carrying network/IAM settings.
    #[serde(default)]
    pub launch_template: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    /// Used for the kill-time cost estimate.
    #[serde(default)]
    pub hourly_cost_usd: Option<f64>,
}

impl ComputeProfile {
    pub fn new(instance_type: impl Into<String>) -> Self {
        Self {
            instance_type: instance_type.into(),
            image_id: None,
            launch_template: None,
            region: None,
            hourly_cost_usd: None,
        }
    }

    /// Rough cost of running for `elapsed`.
    pub fn estimate_cost(&self, elapsed: std::time::Duration) -> Option<f64> {
        self.hourly_cost_usd
            .map(|rate| rate * elapsed.as_secs_f64() / 3600.0)
    }
}

/// Everything needed to create one run's instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub run_id: RunId,
    pub environment: String,
    pub profile: ComputeProfile,
}

/// Provider-reported lifecycle of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl InstanceState {
    /// No longer billable and nothing left to terminate.
    pub fn is_terminated(self) -> bool {
        matches!(self, InstanceState::Terminated)
    }

    /// Termination has been accepted by the provider.
    pub fn is_terminating(self) -> bool {
        matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "pending" => Some(InstanceState::Pending),
            "running" => Some(InstanceState::Running),
            "stopping" => Some(InstanceState::Stopping),
            "stopped" => Some(InstanceState::Stopped),
            "shutting-down" | "shutting_down" => Some(InstanceState::ShuttingDown),
            "terminated" => Some(InstanceState::Terminated),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("invalid credentials: {0}")]
    Credentials(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Storage still attached to an instance that has not finished terminating.
    #[error("resource in use: {0}")]
    InUse(String),

    #[error("provider error: {0}")]
    Other(String),
}

impl ComputeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ComputeError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ComputeError::Throttled(_) | ComputeError::Unavailable(_)
        )
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self, ComputeError::InUse(_))
    }
}

/// Creates, terminates and observes ephemeral compute resources.
#[async_trait]
pub trait ComputeProvisioner: Send + Sync {
    /// Credential / quota preconditions. Creates nothing.
    async fn check_access(&self, spec: &InstanceSpec) -> Result<(), ComputeError>;

    async fn create(&self, spec: &InstanceSpec) -> Result<InstanceId, ComputeError>;

    /// Request termination; returns the state reported right after the request.
    async fn terminate(&self, instance_id: &InstanceId) -> Result<InstanceState, ComputeError>;

    /// Unknown instances return `ComputeError::NotFound`.
    async fn describe(&self, instance_id: &InstanceId) -> Result<InstanceState, ComputeError>;

    /// Storage tagged with the run that would outlive its instance (volume ids).
    ///
    /// Volumes the provider deletes together with the instance are not listed.
    async fn list_storage(&self, run_id: &RunId) -> Result<Vec<String>, ComputeError>;

    async fn delete_storage(&self, storage_id: &str) -> Result<(), ComputeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parses_provider_state_names() {
        assert_eq!(
            InstanceState::parse("shutting-down"),
            Some(InstanceState::ShuttingDown)
        );
        assert_eq!(InstanceState::parse("terminated\n"), Some(InstanceState::Terminated));
        assert_eq!(InstanceState::parse("exploded"), None);
    }

    #[test]
    fn cost_estimate_scales_with_elapsed() {
        let mut profile = ComputeProfile::new("g5.xlarge");
        assert_eq!(profile.estimate_cost(Duration::from_secs(3600)), None);

        profile.hourly_cost_usd = Some(1.2);
        let cost = profile.estimate_cost(Duration::from_secs(1800)).unwrap();
        assert!((cost - 0.6).abs() < 1e-9);
    }
}
