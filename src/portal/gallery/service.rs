//! 照片墙服务
//!
//! 公共照片墙展示所有人的照片；"我的照片" 只同步当前用户上传的照片。

use crate::portal::backend::{Backend, Filter};
use crate::portal::gallery::models::{GalleryEdit, GalleryItem, GalleryRecord};
use crate::portal::storage::{upload_media, MediaUpload};
use crate::portal::sync::error::{Result, SyncError};
use crate::portal::sync::listener::SyncListener;
use crate::portal::sync::models::ListSyncerConfig;
use crate::portal::sync::service::ListSyncer;
use std::sync::Arc;
use tracing::info;

pub const GALLERY_BUCKET: &str = "gallery";

pub struct Gallery {
    backend: Backend,
    syncer: ListSyncer<GalleryItem>,
}

impl Gallery {
    /// 公共照片墙
    pub fn public(backend: Backend, listener: Arc<dyn SyncListener>) -> Self {
        Self::with_config(backend, ListSyncerConfig::for_entity::<GalleryItem>(), listener)
    }

    /// 当前用户的照片
    pub fn mine(backend: Backend, listener: Arc<dyn SyncListener>) -> Result<Self> {
        Self::mine_with_config(backend, ListSyncerConfig::for_entity::<GalleryItem>(), listener)
    }

    /// 在 `config` 基础上加上当前用户过滤
    pub fn mine_with_config(
        backend: Backend,
        config: ListSyncerConfig,
        listener: Arc<dyn SyncListener>,
    ) -> Result<Self> {
        let user = backend
            .identity
            .current_user()
            .ok_or(SyncError::NotSignedIn)?;
        let config = config
            .with_filter(Filter::new().eq("user_id", user.id))
            .with_log_tag("[MyGallerySync]");
        Ok(Self::with_config(backend, config, listener))
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

    pub async fn open(&self) -> Result<usize> {
        self.syncer.initialize().await
    }

    pub fn items(&self) -> Vec<GalleryRecord> {
        self.syncer.records()
    }

    pub fn syncer(&self) -> &ListSyncer<GalleryItem> {
        &self.syncer
    }

    /// 上传照片并发布到照片墙
    pub async fn upload_photo(
        &self,
        title: &str,
        description: &str,
        image: MediaUpload,
    ) -> Result<GalleryRecord> {
        let user = self
            .backend
            .identity
            .current_user()
            .ok_or(SyncError::NotSignedIn)?;
        let title = title.trim();
        if title.is_empty() {
            return Err(SyncError::InvalidInput("照片标题不能为空".to_string()));
        }
        if !image.content_type.starts_with("image/") {
            return Err(SyncError::InvalidInput(format!(
                "{} 不是图片（{}）",
                image.file_name, image.content_type
            )));
        }

        let image_url = upload_media(
            self.backend.data.as_ref(),
            GALLERY_BUCKET,
            None,
            image,
            self.syncer.config().request_timeout,
        )
        .await?;
        info!("[GallerySync] 🖼️ 发布照片: {}", title);
        self.syncer
            .create_record(&GalleryItem {
                user_id: user.id,
                title: title.to_string(),
                description: description.trim().to_string(),
                image_url,
            })
            .await
    }

    /// 修改标题和说明
    pub async fn edit_photo(&self, id: &str, title: &str, description: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SyncError::InvalidInput("照片标题不能为空".to_string()));
        }
        let edit = GalleryEdit {
            title: title.to_string(),
            description: description.trim().to_string(),
        };
        self.syncer.update_record(id, &edit).await
    }

    pub async fn delete_photo(&self, id: &str) -> Result<()> {
        self.syncer.delete_record(id).await
    }

    pub fn can_edit(&self, item: &GalleryRecord) -> bool {
        self.syncer.can_modify(item)
    }

    pub async fn close(&self) {
        self.syncer.teardown().await;
    }
}
