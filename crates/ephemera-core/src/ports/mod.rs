//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（Blob storage, クラウドの compute API, 学習プロセス）
//! へのインターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - controller と worker が共有するのは BlobStore 上の RunState だけ
//! - すべての trait は fake に差し替えてテストできる

pub mod blob_store;
pub mod clock;
pub mod compute;
pub mod data_sync;
pub mod host_probe;
pub mod id_generator;
pub mod trainer;

pub use self::blob_store::{BlobError, BlobStore};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::compute::{
    ComputeError, ComputeProfile, ComputeProvisioner, InstanceSpec, InstanceState,
};
pub use self::data_sync::DataSync;
pub use self::host_probe::{HostProbe, HostReport};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::trainer::Trainer;
