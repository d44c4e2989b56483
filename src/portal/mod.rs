pub mod auth;
pub mod backend;
pub mod chat;
pub mod client;
pub mod contacts;
pub mod db;
pub mod gallery;
pub mod news;
pub mod profile;
pub mod serialization;
pub mod storage;
pub mod sync;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// 重新导出同步器核心类型
pub use sync::{ListSyncer, ListSyncerConfig, SyncError, SyncListener};
