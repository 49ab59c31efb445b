//! AwsCliProvisioner - `aws ec2` CLI を叩く ComputeProvisioner
//!
//! SDK を持ち込まず、worker image と operator 端末に既にある `aws` コマンドを使います。
//! instance と volume には run_id を tag として付け、cleanup は tag で探します。

use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::domain::{InstanceId, RunId};
use crate::ports::{ComputeError, ComputeProvisioner, InstanceSpec, InstanceState};

/// Tag key carrying the run id on every resource this provisioner creates.
pub const RUN_TAG: &str = "ephemera:run_id";
const ENV_TAG: &str = "ephemera:environment";

/// Region and credentials profile shared by every `aws` invocation.
#[derive(Debug, Clone, Default)]
pub struct AwsCli {
    region: Option<String>,
    profile: Option<String>,
}

impl AwsCli {
    pub fn new(region: Option<String>, profile: Option<String>) -> Self {
        Self { region, profile }
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    /// Run `aws <service> <args..>`, optionally feeding `stdin`.
    pub(crate) async fn run(
        &self,
        service: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> std::io::Result<Output> {
        let mut cmd = Command::new("aws");
        cmd.arg(service).args(args);
        if let Some(region) = &self.region {
            cmd.args(["--region", region.as_str()]);
        }
        if let Some(profile) = &self.profile {
            cmd.args(["--profile", profile.as_str()]);
        }
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(service, subcommand = %args.first().map(String::as_str).unwrap_or(""), "aws");
        let mut child = cmd.spawn()?;
        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes).await?;
            // closing stdin signals end of input
            drop(pipe);
        }
        child.wait_with_output().await
    }
}

#[derive(Debug, Clone, Default)]
pub struct AwsCliProvisioner {
    cli: AwsCli,
}

impl AwsCliProvisioner {
    pub fn new(region: Option<String>) -> Self {
        Self {
            cli: AwsCli::new(region, None),
        }
    }

    /// Named credentials profile (`--profile`).
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.cli = self.cli.with_profile(Some(profile.into()));
        self
    }

    async fn ec2(&self, args: &[String]) -> Result<String, ComputeError> {
        let output = self
            .cli
            .run("ec2", args, None)
            .await
            .map_err(|e| ComputeError::Unavailable(format!("aws cli: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(classify_stderr(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    fn launch_args(spec: &InstanceSpec, dry_run: bool) -> Vec<String> {
        let mut args = vec![
            "run-instances".to_string(),
            "--count".to_string(),
            "1".to_string(),
            "--instance-type".to_string(),
            spec.profile.instance_type.clone(),
        ];
        if let Some(template) = &spec.profile.launch_template {
            args.push("--launch-template".to_string());
            args.push(format!("LaunchTemplateName={template}"));
        }
        if let Some(image) = &spec.profile.image_id {
            args.push("--image-id".to_string());
            args.push(image.clone());
        }
        let tags = format!(
            "{{Key={RUN_TAG},Value={}}},{{Key={ENV_TAG},Value={}}}",
            spec.run_id, spec.environment
        );
        args.push("--tag-specifications".to_string());
        args.push(format!("ResourceType=instance,Tags=[{tags}]"));
        args.push(format!("ResourceType=volume,Tags=[{tags}]"));
        if dry_run {
            args.push("--dry-run".to_string());
        } else {
            // run_id doubles as the idempotency token
            args.push("--client-token".to_string());
            args.push(spec.run_id.to_string());
            args.extend(query_text("Instances[0].InstanceId"));
        }
        args
    }
}

/// Run-tagged volumes that outlive their instance: detached ones, and attached
/// ones without delete-on-termination.
fn list_storage_args(run_id: &RunId) -> Vec<String> {
    vec![
        "describe-volumes".to_string(),
        "--filters".to_string(),
        format!("Name=tag:{RUN_TAG},Values={run_id}"),
        "--query".to_string(),
        "Volumes[?Attachments[0].DeleteOnTermination != `true`].VolumeId".to_string(),
        "--output".to_string(),
        "json".to_string(),
    ]
}

fn query_text(query: &str) -> [String; 4] {
    [
        "--query".to_string(),
        query.to_string(),
        "--output".to_string(),
        "text".to_string(),
    ]
}

/// Map AWS error codes found in stderr onto the port's error kinds.
fn classify_stderr(stderr: &str) -> ComputeError {
    let msg = stderr.trim().to_string();
    let has = |needle: &str| stderr.contains(needle);

    if has("NotFound") {
        ComputeError::NotFound(msg)
    } else if has("VolumeInUse") || has("IncorrectState") {
        ComputeError::InUse(msg)
    } else if has("RequestLimitExceeded") || has("Throttling") {
        ComputeError::Throttled(msg)
    } else if has("InsufficientInstanceCapacity") || has("ServiceUnavailable") || has("InternalError") {
        ComputeError::Unavailable(msg)
    } else if has("UnauthorizedOperation")
        || has("AuthFailure")
        || has("ExpiredToken")
        || has("InvalidClientTokenId")
        || has("Unable to locate credentials")
    {
        ComputeError::Credentials(msg)
    } else if has("InstanceLimitExceeded") || has("VcpuLimitExceeded") {
        ComputeError::QuotaExceeded(msg)
    } else if has("InvalidParameter") || has("MissingParameter") {
        ComputeError::InvalidRequest(msg)
    } else {
        ComputeError::Other(msg)
    }
}

fn parse_state(raw: &str) -> Result<InstanceState, ComputeError> {
    InstanceState::parse(raw)
        .ok_or_else(|| ComputeError::Other(format!("unexpected instance state: {raw}")))
}

#[async_trait]
impl ComputeProvisioner for AwsCliProvisioner {
    async fn check_access(&self, spec: &InstanceSpec) -> Result<(), ComputeError> {
        // --dry-run reports success as a DryRunOperation error
        match self.ec2(&Self::launch_args(spec, true)).await {
            Ok(_) => Ok(()),
            Err(ComputeError::Other(msg)) if msg.contains("DryRunOperation") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<InstanceId, ComputeError> {
        let out = self.ec2(&Self::launch_args(spec, false)).await?;
        if out.is_empty() || out == "None" {
            return Err(ComputeError::Other("run-instances returned no instance id".into()));
        }
        Ok(InstanceId::new(out))
    }

    async fn terminate(&self, instance_id: &InstanceId) -> Result<InstanceState, ComputeError> {
        let mut args = vec![
            "terminate-instances".to_string(),
            "--instance-ids".to_string(),
            instance_id.to_string(),
        ];
        args.extend(query_text("TerminatingInstances[0].CurrentState.Name"));
        parse_state(&self.ec2(&args).await?)
    }

    async fn describe(&self, instance_id: &InstanceId) -> Result<InstanceState, ComputeError> {
        let mut args = vec![
            "describe-instances".to_string(),
            "--instance-ids".to_string(),
            instance_id.to_string(),
        ];
        args.extend(query_text("Reservations[0].Instances[0].State.Name"));
        let out = self.ec2(&args).await?;
        if out == "None" {
            return Err(ComputeError::NotFound(instance_id.to_string()));
        }
        parse_state(&out)
    }

    async fn list_storage(&self, run_id: &RunId) -> Result<Vec<String>, ComputeError> {
        let out = self.ec2(&list_storage_args(run_id)).await?;
        serde_json::from_str(&out)
            .map_err(|e| ComputeError::Other(format!("describe-volumes output: {e}")))
    }

    async fn delete_storage(&self, storage_id: &str) -> Result<(), ComputeError> {
        let args = vec![
            "delete-volume".to_string(),
            "--volume-id".to_string(),
            storage_id.to_string(),
        ];
        self.ec2(&args).await.map(|_| ())
    }
}
