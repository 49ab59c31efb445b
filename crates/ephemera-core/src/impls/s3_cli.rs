//! S3CliBlobStore - `aws s3` / `aws s3api` CLI を叩く BlobStore
//!
//! AwsCliProvisioner と同じく SDK は持ち込みません。key は `prefix/` の下に置きます。
//! S3 に rename は無いので copy-object してから delete-object します。
//! copy-object は宛先を 1 回で置き換えるため、reader は古い値か新しい値の
//! どちらか全体しか見ません。

use async_trait::async_trait;

use super::aws_cli::AwsCli;
use crate::ports::{BlobError, BlobStore};

#[derive(Debug, Clone)]
pub struct S3CliBlobStore {
    cli: AwsCli,
    bucket: String,
    prefix: Option<String>,
}

impl S3CliBlobStore {
    pub fn new(bucket: impl Into<String>, region: Option<String>) -> Self {
        Self {
            cli: AwsCli::new(region, None),
            bucket: bucket.into(),
            prefix: None,
        }
    }

    /// Named credentials profile (`--profile`).
    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.cli = self.cli.with_profile(profile);
        self
    }

    /// Place every key under `prefix/`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        self.prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_key(&self, key: &str) -> Result<String, BlobError> {
        let escapes = key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
        if escapes {
            return Err(BlobError::Denied(format!("invalid key: {key}")));
        }
        Ok(match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        })
    }

    fn url(&self, object_key: &str) -> String {
        format!("s3://{}/{object_key}", self.bucket)
    }

    fn object_args(&self, op: &str, object_key: &str) -> Vec<String> {
        vec![
            op.to_string(),
            "--bucket".to_string(),
            self.bucket.clone(),
            "--key".to_string(),
            object_key.to_string(),
        ]
    }

    async fn call(
        &self,
        service: &str,
        args: Vec<String>,
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>, BlobError> {
        let output = self
            .cli
            .run(service, &args, stdin)
            .await
            .map_err(|e| BlobError::Unavailable(format!("aws cli: {e}")))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(classify_stderr(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    async fn head(&self, object_key: &str) -> Result<bool, BlobError> {
        match self.call("s3api", self.object_args("head-object", object_key), None).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl BlobStore for S3CliBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let url = self.url(&self.object_key(key)?);
        let args = vec!["cp".to_string(), "--only-show-errors".to_string(), url, "-".to_string()];
        self.call("s3", args, None)
            .await
            .map_err(|e| if e.is_not_found() { BlobError::NotFound(key.to_string()) } else { e })
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let url = self.url(&self.object_key(key)?);
        let args = vec!["cp".to_string(), "--only-show-errors".to_string(), "-".to_string(), url];
        self.call("s3", args, Some(&bytes)).await.map(|_| ())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), BlobError> {
        let source = self.object_key(from)?;
        let target = self.object_key(to)?;
        let mut args = self.object_args("copy-object", &target);
        args.push("--copy-source".to_string());
        args.push(format!("{}/{source}", self.bucket));
        self.call("s3api", args, None)
            .await
            .map_err(|e| if e.is_not_found() { BlobError::NotFound(from.to_string()) } else { e })?;

        // コピー済みなので、元が消えなくても rename としては成功
        if let Err(e) = self.call("s3api", self.object_args("delete-object", &source), None).await {
            tracing::warn!(key = from, error = %e, "renamed object left its source behind");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let object_key = self.object_key(key)?;
        // delete-object は無い key でも成功するので、先に有無を見る
        if !self.head(&object_key).await? {
            return Ok(false);
        }
        self.call("s3api", self.object_args("delete-object", &object_key), None)
            .await?;
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        self.head(&self.object_key(key)?).await
    }
}

/// Map `aws s3` stderr onto BlobError.
fn classify_stderr(stderr: &str) -> BlobError {
    let msg = stderr.trim().to_string();
    let has = |needle: &str| stderr.contains(needle);

    if has("NoSuchKey") || has("(404)") || has("Not Found") {
        BlobError::NotFound(msg)
    } else if has("SlowDown")
        || has("(503)")
        || has("(500)")
        || has("InternalError")
        || has("ServiceUnavailable")
        || has("RequestTimeout")
        || has("Could not connect")
    {
        BlobError::Unavailable(msg)
    } else if has("AccessDenied")
        || has("(403)")
        || has("Forbidden")
        || has("InvalidAccessKeyId")
        || has("SignatureDoesNotMatch")
        || has("ExpiredToken")
        || has("Unable to locate credentials")
        || has("NoSuchBucket")
    {
        BlobError::Denied(msg)
    } else {
        BlobError::Io(std::io::Error::other(msg))
    }
}
