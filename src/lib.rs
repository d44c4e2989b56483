pub mod portal;

// 重新导出常用类型，方便外部使用
pub use portal::{
    auth::{Session, SessionStore},
    backend::{Backend, DataAccess, Identity, PushSubscription},
    chat::ChatRoom,
    client::{ClientConfig, PortalClient},
    contacts::{ContactDirectory, ContactDraft},
    gallery::Gallery,
    news::NewsBoard,
    profile::ProfileService,
    storage::MediaUpload,
    sync::{Entity, ListSyncer, ListSyncerConfig, Record, SyncError, SyncListener},
};
