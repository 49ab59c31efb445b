//! Subprocess-backed collaborators: trainer, data sync and GPU probe.
//!
//! All of them shell out the way the worker image expects (`python -m ...`,
//! `aws s3 sync ...`, `nvidia-smi`) and stream child output into tracing.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::domain::{RunError, RunId};
use crate::ports::{DataSync, HostProbe, HostReport, Trainer};

/// Name of the file the trainer's config is written to inside the workdir.
pub const CONFIG_FILE: &str = "training_config.json";

/// A program plus arguments. Arguments may contain `{run_id}`, `{workdir}` and
/// `{config}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn render(&self, vars: &[(&str, &str)]) -> Command {
        let mut cmd = Command::new(&self.program);
        for arg in &self.args {
            let mut rendered = arg.clone();
            for (name, value) in vars {
                rendered = rendered.replace(&format!("{{{name}}}"), value);
            }
            cmd.arg(rendered);
        }
        cmd.envs(&self.env);
        cmd
    }
}

/// Spawn `cmd`, forward each output line to tracing, and wait for it.
async fn run_streaming(mut cmd: Command, label: &'static str) -> std::io::Result<ExitStatus> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take().map(|out| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "ephemera::child", source = label, "{line}");
            }
        })
    });
    let stderr = child.stderr.take().map(|err| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "ephemera::child", source = label, "{line}");
            }
        })
    });

    let status = child.wait().await?;
    for task in [stdout, stderr].into_iter().flatten() {
        let _ = task.await;
    }
    Ok(status)
}

/// Runs the training entrypoint as a child process.
pub struct CommandTrainer {
    command: CommandSpec,
}

impl CommandTrainer {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Trainer for CommandTrainer {
    async fn run(&self, config: &serde_json::Value, workdir: &Path) -> Result<i32, RunError> {
        let config_path = workdir.join(CONFIG_FILE);
        tokio::fs::write(&config_path, serde_json::to_vec_pretty(config)?).await?;

        let workdir_str = workdir.display().to_string();
        let config_str = config_path.display().to_string();
        let mut cmd = self.command.render(&[
            ("workdir", workdir_str.as_str()),
            ("config", config_str.as_str()),
        ]);
        cmd.current_dir(workdir);

        tracing::info!(program = %self.command.program, "starting trainer");
        let status = run_streaming(cmd, "trainer")
            .await
            .map_err(|e| RunError::Trainer(format!("{}: {e}", self.command.program)))?;

        // killed by a signal has no code
        Ok(status.code().unwrap_or(-1))
    }
}

/// Sync-in / sync-out through external commands (e.g. `aws s3 sync`).
pub struct CommandSync {
    sync_in: Option<CommandSpec>,
    sync_out: Option<CommandSpec>,
}

impl CommandSync {
    pub fn new(sync_in: Option<CommandSpec>, sync_out: Option<CommandSpec>) -> Self {
        Self { sync_in, sync_out }
    }

    async fn run(
        spec: Option<&CommandSpec>,
        label: &'static str,
        run_id: &RunId,
        workdir: &Path,
    ) -> Result<(), RunError> {
        let Some(spec) = spec else {
            tracing::debug!(direction = label, "no sync command configured");
            return Ok(());
        };
        let workdir_str = workdir.display().to_string();
        let cmd = spec.render(&[
            ("run_id", run_id.as_str()),
            ("workdir", workdir_str.as_str()),
        ]);
        let status = run_streaming(cmd, label)
            .await
            .map_err(|e| RunError::Sync {
                message: format!("{}: {e}", spec.program),
                transient: false,
            })?;
        if status.success() {
            Ok(())
        } else {
            // sync tools exit non-zero on network errors; worth a retry
            Err(RunError::Sync {
                message: format!("{} exited with {status}", spec.program),
                transient: true,
            })
        }
    }
}

#[async_trait]
impl DataSync for CommandSync {
    async fn sync_in(&self, run_id: &RunId, workdir: &Path) -> Result<(), RunError> {
        Self::run(self.sync_in.as_ref(), "sync_in", run_id, workdir).await
    }

    async fn sync_out(&self, run_id: &RunId, workdir: &Path) -> Result<(), RunError> {
        Self::run(self.sync_out.as_ref(), "sync_out", run_id, workdir).await
    }
}

/// Probes GPUs with `nvidia-smi`.
#[derive(Debug, Clone, Default)]
pub struct NvidiaSmiProbe;

#[async_trait]
impl HostProbe for NvidiaSmiProbe {
    async fn probe(&self) -> Result<HostReport, RunError> {
        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=name", "--format=csv,noheader"])
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("nvidia-smi not found");
                return Ok(HostReport::default());
            }
            Err(e) => return Err(RunError::Preflight(format!("nvidia-smi: {e}"))),
        };

        if !output.status.success() {
            return Ok(HostReport::default());
        }
        Ok(HostReport {
            driver_loaded: true,
            gpu_names: parse_gpu_names(&String::from_utf8_lossy(&output.stdout)),
        })
    }
}

fn parse_gpu_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nvidia_smi_csv() {
        let names = parse_gpu_names("NVIDIA A10G\nNVIDIA A10G\n\n");
        assert_eq!(names, vec!["NVIDIA A10G", "NVIDIA A10G"]);
    }

    #[test]
    fn placeholders_are_rendered() {
        let spec = CommandSpec::new("aws")
            .arg("s3")
            .arg("sync")
            .arg("s3://bucket/{run_id}/input")
            .arg("{workdir}/input");
        let cmd = spec.render(&[("run_id", "R1"), ("workdir", "/data/run")]);
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["s3", "sync", "s3://bucket/R1/input", "/data/run/input"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn trainer_reports_exit_code_and_writes_config() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = CommandTrainer::new(
            CommandSpec::new("sh")
                .arg("-c")
                .arg("test -f {config} && exit 3"),
        );

        let code = trainer
            .run(&serde_json::json!({"epochs": 1}), dir.path())
            .await
            .unwrap();
        assert_eq!(code, 3);
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_sync_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let sync = CommandSync::new(Some(CommandSpec::new("sh").arg("-c").arg("exit 2")), None);

        let err = sync.sync_in(&RunId::new("R1"), dir.path()).await.unwrap_err();
        assert!(matches!(err, RunError::Sync { transient: true, .. }));
        assert!(sync.sync_out(&RunId::new("R1"), dir.path()).await.is_ok());
    }
}
