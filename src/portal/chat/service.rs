//! 聊天室服务

use crate::portal::backend::Backend;
use crate::portal::chat::models::{ChatMessage, ChatRecord, MessageType, SENT_A_FILE};
use crate::portal::storage::{upload_media, MediaUpload};
use crate::portal::sync::error::{Result, SyncError};
use crate::portal::sync::listener::SyncListener;
use crate::portal::sync::models::ListSyncerConfig;
use crate::portal::sync::service::ListSyncer;
use std::sync::Arc;
use tracing::info;

/// 附件存储桶
pub const CHAT_MEDIA_BUCKET: &str = "chat_media";

/// 社区聊天室（按时间正序）
pub struct ChatRoom {
    backend: Backend,
    syncer: ListSyncer<ChatMessage>,
}

impl ChatRoom {
    pub fn new(backend: Backend, listener: Arc<dyn SyncListener>) -> Self {
        Self::with_config(backend, ListSyncerConfig::for_entity::<ChatMessage>(), listener)
    }

    pub fn with_config(
        backend: Backend,
        config: ListSyncerConfig,
        listener: Arc<dyn SyncListener>,
    ) -> Self {
        Self {
            syncer: ListSyncer::with_listener(backend.clone(), config, listener),
            backend,
        }
    }

    /// 加载历史消息并开始接收新消息
    pub async fn open(&self) -> Result<usize> {
        self.syncer.initialize().await
    }

    pub fn messages(&self) -> Vec<ChatRecord> {
        self.syncer.records()
    }

    pub fn syncer(&self) -> &ListSyncer<ChatMessage> {
        &self.syncer
    }

    /// 发送消息，可附带图片/视频/语音
    ///
    /// 消息在推送回显后才出现在 [`messages`](Self::messages) 中。
    pub async fn send_message(&self, text: &str, media: Option<MediaUpload>) -> Result<ChatRecord> {
        let user = self
            .backend
            .identity
            .current_user()
            .ok_or(SyncError::NotSignedIn)?;
        let text = text.trim();
        if text.is_empty() && media.is_none() {
            return Err(SyncError::InvalidInput("消息内容不能为空".to_string()));
        }

        let (message_type, media_url) = match media {
            Some(media) => {
                let message_type = MessageType::from_mime(&media.content_type);
                let url = upload_media(
                    self.backend.data.as_ref(),
                    CHAT_MEDIA_BUCKET,
                    Some(&user.id),
                    media,
                    self.syncer.config().request_timeout,
                )
                .await?;
                (message_type, Some(url))
            }
            None => (MessageType::Text, None),
        };

        let message = match (text.is_empty(), message_type) {
            (false, _) => text.to_string(),
            (true, MessageType::Text) => String::new(),
            (true, _) => SENT_A_FILE.to_string(),
        };
        info!("[ChatSync] 💬 发送 {:?} 消息", message_type);
        self.syncer
            .create_record(&ChatMessage {
                user_id: user.id,
                message,
                message_type,
                media_url,
            })
            .await
    }

    /// 删除自己的消息
    pub async fn delete_message(&self, id: &str) -> Result<()> {
        self.syncer.delete_record(id).await
    }

    pub fn can_delete(&self, message: &ChatRecord) -> bool {
        self.syncer.can_modify(message)
    }

    pub async fn close(&self) {
        self.syncer.teardown().await;
    }
}
