//! ephemera-core
//!
//! Lifecycle engine for ephemeral GPU training runs: one instance per run,
//! torn down when the run ends.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, RunStatus, RunState, errors, decision, artifacts）
//! - **ports**: 抽象化レイヤー（BlobStore, ComputeProvisioner, Trainer, DataSync, HostProbe, Clock）
//! - **app**: ライフサイクル（StateStore, Launcher, PhaseExecutor, CleanupAgent, Monitor, Killer）
//! - **impls**: 実装（ローカル FS, aws CLI, 子プロセス, テスト用 fake）
//! - **config**: `ephemera.toml`

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
