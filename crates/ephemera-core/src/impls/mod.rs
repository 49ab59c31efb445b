//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryBlobStore / InMemoryProvisioner**: テスト用の fake（障害注入つき）
//! - **LocalBlobStore**: 共有ファイルシステム上の state 置き場
//! - **AwsCliProvisioner**: `aws ec2` CLI による instance / volume 管理
//! - **S3CliBlobStore**: `aws s3api` CLI による S3 上の state 置き場
//! - **CommandTrainer / CommandSync / NvidiaSmiProbe**: worker 上の子プロセス
//! - **Scripted***: 開発用の台本どおりに動く collaborator

pub mod aws_cli;
pub mod inmem_blob;
pub mod inmem_compute;
pub mod local_blob;
pub mod process;
pub mod s3_cli;
pub mod stub;

pub use self::aws_cli::AwsCliProvisioner;
pub use self::inmem_blob::{BlobOp, Fault, InMemoryBlobStore, RenameGate};
pub use self::inmem_compute::{ComputeFault, ComputeOp, InMemoryProvisioner};
pub use self::local_blob::LocalBlobStore;
pub use self::s3_cli::S3CliBlobStore;
pub use self::process::{CommandSpec, CommandSync, CommandTrainer, NvidiaSmiProbe};
pub use self::stub::{ScriptedSync, ScriptedTrainer, StaticProbe};
