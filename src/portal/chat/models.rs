//! 聊天消息模型

use crate::portal::backend::{JoinSpec, SortDirection};
use crate::portal::serialization::deserialize_null_default;
use crate::portal::sync::models::{Entity, Record};
use serde::{Deserialize, Serialize};

/// 只发附件、没有文字时的消息内容
pub const SENT_A_FILE: &str = "Sent a file";

/// 消息类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
}

impl MessageType {
    /// 按附件的 MIME 类型判断，无法识别的附件按文本消息处理
    pub fn from_mime(content_type: &str) -> Self {
        if content_type.starts_with("image/") {
            MessageType::Image
        } else if content_type.starts_with("video/") {
            MessageType::Video
        } else if content_type.starts_with("audio/") {
            MessageType::Audio
        } else {
            MessageType::Text
        }
    }
}

/// 聊天消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user_id: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub message: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub media_url: Option<String>,
}

impl Entity for ChatMessage {
    const COLLECTION: &'static str = "chat_messages";
    const OWNER_FIELD: &'static str = "user_id";
    const DIRECTION: SortDirection = SortDirection::Ascending;
    const LOG_TAG: &'static str = "[ChatSync]";

    fn owner_id(&self) -> &str {
        &self.user_id
    }

    fn join() -> Option<JoinSpec> {
        Some(JoinSpec::profiles("user_id", &["full_name", "avatar_url"]))
    }
}

pub type ChatRecord = Record<ChatMessage>;
