//! HostProbe port - instance 起動直後の GPU / ドライバ確認

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::RunError;

/// What the worker found on its host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostReport {
    pub driver_loaded: bool,
    pub gpu_names: Vec<String>,
}

impl HostReport {
    pub fn gpu_count(&self) -> usize {
        self.gpu_names.len()
    }

    /// Problems that make this host unusable for a run needing `min_gpus`.
    pub fn problems(&self, min_gpus: usize) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.driver_loaded && min_gpus > 0 {
            problems.push("GPU driver not loaded".to_string());
        }
        if self.gpu_count() < min_gpus {
            problems.push(format!(
                "found {} GPU(s), need at least {}",
                self.gpu_count(),
                min_gpus
            ));
        }
        problems
    }
}

#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn probe(&self) -> Result<HostReport, RunError>;
}
