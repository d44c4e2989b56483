//! 社区聊天模块

pub mod models;
pub mod service;

pub use models::{ChatMessage, ChatRecord, MessageType, SENT_A_FILE};
pub use service::ChatRoom;
