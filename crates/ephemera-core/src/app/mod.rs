//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせて run のライフサイクルを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 構築とワイヤリング
//! - **StateStore**: RunState の atomic な読み書き
//! - **Retrier**: ErrorClassifier の決定に従うリトライ
//! - **Launcher**: run の開始（controller）
//! - **PhaseExecutor / Watchdog**: phase の実行（worker）
//! - **CleanupAgent**: 冪等な後片付け
//! - **Monitor / Killer**: 観測と強制停止（controller）

pub mod artifacts;
pub mod builder;
pub mod cleanup;
pub mod executor;
pub mod killer;
pub mod launcher;
pub mod monitor;
pub mod retry;
pub mod state_store;
pub mod watchdog;

// 主要な型を再エクスポート
pub use self::artifacts::RunArtifacts;
pub use self::builder::{App, AppBuilder, BuildError, Timeouts};
pub use self::cleanup::CleanupAgent;
pub use self::executor::{PhaseExecutor, RunOutcome, WorkerOptions, WorkerParts};
pub use self::killer::{KillOptions, KillReport, Killer};
pub use self::launcher::{LaunchRequest, Launcher};
pub use self::monitor::{Monitor, MonitorEvent, RunView};
pub use self::retry::Retrier;
pub use self::state_store::StateStore;
pub use self::watchdog::{Watchdog, WatchdogHandle};
