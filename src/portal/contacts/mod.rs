//! 紧急联系人名录模块
//!
//! 用户提交的联系人需要管理员审核后才会出现在公开列表中。

pub mod models;
pub mod service;

pub use models::{ContactDraft, ContactRecord, EmergencyContact};
pub use service::ContactDirectory;
