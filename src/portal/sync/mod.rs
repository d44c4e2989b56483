//! 实时列表同步
//!
//! 一个通用的同步器 [`ListSyncer`]，按实体类型实例化（聊天、照片墙、新闻、联系人）。

pub mod error;
pub mod list;
pub mod listener;
pub mod models;
pub mod service;

pub use error::{MutationKind, SyncError};
pub use list::{Applied, OrderedList};
pub use listener::{EmptySyncListener, SyncListener};
pub use models::{
    Author, ChangeEvent, Entity, ListSyncerConfig, MutationPolicy, Record,
    DEFAULT_REQUEST_TIMEOUT, UNKNOWN_AUTHOR,
};
pub use service::ListSyncer;
