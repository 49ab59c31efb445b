//! ephemera.toml の読み込み
//!
//! ```toml
//! environment = "dev"
//!
//! [storage]
//! root = "/mnt/ephemera-state"
//! # または S3
//! # backend = "s3"
//! # bucket = "ml-ephemera"
//! # prefix = "state"
//!
//! [compute]
//! instance_type = "g5.xlarge"
//! region = "us-east-1"
//! hourly_cost_usd = 1.006
//!
//! [worker]
//! workdir = "/opt/ephemera/run"
//! trainer = { program = "python", args = ["train.py", "--config", "{config}"] }
//! ```
//!
//! セクションはすべて省略可能。省略時は標準の値を使う。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::{KillOptions, Timeouts, WorkerOptions};
use crate::domain::{RetryPolicy, RunError};
use crate::impls::CommandSpec;
use crate::ports::ComputeProfile;

pub const DEFAULT_CONFIG_FILE: &str = "ephemera.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeraConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub compute: ComputeSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub kill: KillSettings,
}

/// Where the state object and run artifacts live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Directory used by the `local` backend.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    /// Bucket used by the `s3` backend.
    #[serde(default)]
    pub bucket: Option<String>,

    /// Key prefix inside the bucket.
    #[serde(default)]
    pub prefix: Option<String>,

    /// Bucket region; falls back to `compute.region`.
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// A directory, typically a shared mount.
    #[default]
    Local,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeSettings {
    #[serde(flatten)]
    pub profile: ComputeProfile,

    /// Named AWS CLI profile (`--profile`).
    #[serde(default)]
    pub aws_profile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Per-call timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_storage_timeout")]
    pub storage_secs: u64,
    #[serde(default = "default_compute_timeout")]
    pub compute_secs: u64,
    #[serde(default = "default_sync_timeout")]
    pub sync_secs: u64,
    #[serde(default = "default_trainer_timeout")]
    pub trainer_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    #[serde(default = "default_min_gpus")]
    pub min_gpus: usize,

    /// Watchdog limit on the whole run. Unset means no limit.
    #[serde(default)]
    pub max_run_duration_secs: Option<u64>,

    #[serde(default = "default_state_poll")]
    pub state_poll_secs: u64,

    #[serde(default = "default_trainer_command")]
    pub trainer: CommandSpec,

    #[serde(default)]
    pub sync_in: Option<CommandSpec>,

    #[serde(default)]
    pub sync_out: Option<CommandSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSettings {
    /// Upper bound on waiting for the instance to terminate.
    #[serde(default = "default_kill_wait")]
    pub wait_secs: u64,
    #[serde(default = "default_kill_poll")]
    pub poll_secs: u64,
}

impl EphemeraConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.compute.profile.instance_type.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "compute.instance_type must not be empty".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::S3
            && self.storage.bucket.as_deref().is_none_or(|b| b.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "storage.bucket is required for the s3 backend".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.worker.trainer.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "worker.trainer.program must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(self.retry.base_delay_secs),
            multiplier: self.retry.multiplier,
            max_attempts: self.retry.max_attempts,
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            storage: Duration::from_secs(self.timeouts.storage_secs),
            compute: Duration::from_secs(self.timeouts.compute_secs),
            sync: Duration::from_secs(self.timeouts.sync_secs),
            trainer: Duration::from_secs(self.timeouts.trainer_secs),
        }
    }

    pub fn worker_options(&self) -> WorkerOptions {
        let mut options = WorkerOptions::new(&self.worker.workdir);
        options.min_gpus = self.worker.min_gpus;
        options.max_run_duration = self.worker.max_run_duration_secs.map(Duration::from_secs);
        options.state_poll = Duration::from_secs(self.worker.state_poll_secs);
        options.sync_timeout = Duration::from_secs(self.timeouts.sync_secs);
        options.trainer_timeout = Duration::from_secs(self.timeouts.trainer_secs);
        options
    }

    pub fn kill_options(&self, reason: impl Into<String>) -> KillOptions {
        KillOptions {
            reason: reason.into(),
            wait: Duration::from_secs(self.kill.wait_secs),
            poll_interval: Duration::from_secs(self.kill.poll_secs),
        }
    }

    /// Region for the state bucket.
    pub fn storage_region(&self) -> Option<String> {
        self.storage
            .region
            .clone()
            .or_else(|| self.compute.profile.region.clone())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_secs)
    }
}

impl Default for EphemeraConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            storage: StorageSettings::default(),
            compute: ComputeSettings::default(),
            retry: RetrySettings::default(),
            timeouts: TimeoutSettings::default(),
            worker: WorkerSettings::default(),
            monitor: MonitorSettings::default(),
            kill: KillSettings::default(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            root: default_storage_root(),
            bucket: None,
            prefix: None,
            region: None,
        }
    }
}

impl Default for ComputeSettings {
    fn default() -> Self {
        Self {
            profile: ComputeProfile::new(default_instance_type()),
            aws_profile: None,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            storage_secs: default_storage_timeout(),
            compute_secs: default_compute_timeout(),
            sync_secs: default_sync_timeout(),
            trainer_secs: default_trainer_timeout(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            min_gpus: default_min_gpus(),
            max_run_duration_secs: None,
            state_poll_secs: default_state_poll(),
            trainer: default_trainer_command(),
            sync_in: None,
            sync_out: None,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
        }
    }
}

impl Default for KillSettings {
    fn default() -> Self {
        Self {
            wait_secs: default_kill_wait(),
            poll_secs: default_kill_poll(),
        }
    }
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./ephemera-state")
}

fn default_instance_type() -> String {
    "g5.xlarge".to_string()
}

fn default_base_delay() -> u64 {
    5
}

fn default_multiplier() -> f64 {
    3.0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_storage_timeout() -> u64 {
    30
}

fn default_compute_timeout() -> u64 {
    120
}

fn default_sync_timeout() -> u64 {
    3600
}

fn default_trainer_timeout() -> u64 {
    24 * 3600
}

fn default_workdir() -> PathBuf {
    PathBuf::from("/opt/ephemera/run")
}

fn default_min_gpus() -> usize {
    1
}

fn default_state_poll() -> u64 {
    15
}

fn default_trainer_command() -> CommandSpec {
    CommandSpec::new("python")
        .arg("train.py")
        .arg("--config")
        .arg("{config}")
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_kill_wait() -> u64 {
    300
}

fn default_kill_poll() -> u64 {
    10
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        RunError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EphemeraConfig::parse("").unwrap();
        assert_eq!(config.environment, "dev");
        assert_eq!(config.retry_policy(), RetryPolicy::standard());
        assert_eq!(config.timeouts(), Timeouts::default());
        assert_eq!(config.compute.profile.instance_type, "g5.xlarge");
        assert_eq!(config.monitor_interval(), Duration::from_secs(30));
        assert_eq!(config.storage.backend, StorageBackend::Local);

        let kill = config.kill_options("stop");
        assert_eq!(kill.wait, Duration::from_secs(300));
        assert_eq!(kill.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_load_full_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
environment = "prod"

[storage]
root = "/mnt/state"

[compute]
instance_type = "p4d.24xlarge"
region = "us-west-2"
hourly_cost_usd = 32.77
aws_profile = "ml"

[retry]
max_attempts = 5

[worker]
workdir = "/scratch/run"
min_gpus = 8
max_run_duration_secs = 7200
trainer = { program = "torchrun", args = ["train.py", "{config}"] }
sync_in = { program = "aws", args = ["s3", "sync", "s3://bucket/data", "{workdir}/data"] }
"#,
        )
        .unwrap();

        let config = EphemeraConfig::load(&path).unwrap();
        assert_eq!(config.environment, "prod");
        assert_eq!(config.storage.root, PathBuf::from("/mnt/state"));
        assert_eq!(config.compute.profile.region.as_deref(), Some("us-west-2"));
        assert_eq!(config.compute.aws_profile.as_deref(), Some("ml"));
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.retry_policy().base_delay, Duration::from_secs(5));

        let options = config.worker_options();
        assert_eq!(options.workdir, PathBuf::from("/scratch/run"));
        assert_eq!(options.min_gpus, 8);
        assert_eq!(options.max_run_duration, Some(Duration::from_secs(7200)));
        assert_eq!(config.worker.trainer.program, "torchrun");
        assert!(config.worker.sync_in.is_some());
        assert!(config.worker.sync_out.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EphemeraConfig::parse("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = EphemeraConfig::parse("[compute]\ninstance_type = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_s3_storage() {
        let config = EphemeraConfig::parse(
            r#"
[storage]
backend = "s3"
bucket = "ml-ephemera"
prefix = "state"

[compute]
instance_type = "g5.xlarge"
region = "eu-west-1"
"#,
        )
        .unwrap();
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.bucket.as_deref(), Some("ml-ephemera"));
        assert_eq!(config.storage.prefix.as_deref(), Some("state"));
        assert_eq!(config.storage_region().as_deref(), Some("eu-west-1"));
    }

    #[test]
    fn test_s3_storage_requires_bucket() {
        let err = EphemeraConfig::parse("[storage]\nbackend = \"s3\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("storage.bucket")));

        let err = EphemeraConfig::parse("[storage]\nbackend = \"gcs\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = EphemeraConfig::load("/nonexistent/ephemera.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
    }

    #[test]
    fn test_parse_error() {
        let err = EphemeraConfig::parse("environment = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
