//! 分组同步：本地文件扫描、差异计算和集群记录维护

pub mod engine;
pub mod group_events;
pub mod local_files;

pub use engine::GroupSyncEngine;
pub use group_events::GroupWatcher;
pub use local_files::{group_hash, sha256_hex, FileHasher, LocalGroupFiles, Sha256Hasher};
