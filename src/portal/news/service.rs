//! 新闻公告服务

use crate::portal::backend::Backend;
use crate::portal::news::models::{NewsItem, NewsRecord};
use crate::portal::storage::{upload_media, MediaUpload};
use crate::portal::sync::error::{Result, SyncError};
use crate::portal::sync::listener::SyncListener;
use crate::portal::sync::models::ListSyncerConfig;
use crate::portal::sync::service::ListSyncer;
use std::sync::Arc;
use tracing::info;

pub const NEWS_IMAGES_BUCKET: &str = "news_images";

pub struct NewsBoard {
    backend: Backend,
    syncer: ListSyncer<NewsItem>,
}

impl NewsBoard {
    pub fn new(backend: Backend, listener: Arc<dyn SyncListener>) -> Self {
        Self::with_config(backend, ListSyncerConfig::for_entity::<NewsItem>(), listener)
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

    /// 最新的在前
    pub fn items(&self) -> Vec<NewsRecord> {
        self.syncer.records()
    }

    pub fn syncer(&self) -> &ListSyncer<NewsItem> {
        &self.syncer
    }

    /// 发布新闻，配图可选
    pub async fn post_news(
        &self,
        title: &str,
        content: &str,
        image: Option<MediaUpload>,
    ) -> Result<NewsRecord> {
        let user = self
            .backend
            .identity
            .current_user()
            .ok_or(SyncError::NotSignedIn)?;
        let (title, content) = (title.trim(), content.trim());
        if title.is_empty() || content.is_empty() {
            return Err(SyncError::InvalidInput("标题和正文都不能为空".to_string()));
        }

        let image_url = match image {
            Some(image) => Some(
                upload_media(
                    self.backend.data.as_ref(),
                    NEWS_IMAGES_BUCKET,
                    None,
                    image,
                    self.syncer.config().request_timeout,
                )
                .await?,
            ),
            None => None,
        };
        info!("[NewsSync] 📰 发布新闻: {}", title);
        self.syncer
            .create_record(&NewsItem {
                author_id: user.id,
                title: title.to_string(),
                content: content.to_string(),
                image_url,
                category: None,
            })
            .await
    }

    pub async fn delete_news(&self, id: &str) -> Result<()> {
        self.syncer.delete_record(id).await
    }

    pub fn can_delete(&self, item: &NewsRecord) -> bool {
        self.syncer.can_modify(item)
    }

    pub async fn close(&self) {
        self.syncer.teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::testing::{eventually, init_test_logger, FakeBackend, RecordingListener};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn posted_news_shows_up_first_with_author() {
        init_test_logger();
        let fake = FakeBackend::new();
        fake.sign_in("u9");
        fake.seed_profile("u9", "Sarpanch ji");
        fake.echo_writes.store(true, Ordering::SeqCst);
        fake.seed(
            "news",
            json!({
                "id": "n0",
                "created_at": "2020-01-01T00:00:00Z",
                "author_id": "u1",
                "title": "Old notice",
                "content": "…",
                "image_url": null
            }),
        );
        let board = NewsBoard::new(fake.backend(), RecordingListener::new());
        assert_eq!(board.open().await.unwrap(), 1);

        let poster = MediaUpload::new("camp.png", "image/png", vec![7]);
        let posted = board
            .post_news("Health camp", "Free eye check-up on Sunday", Some(poster))
            .await
            .unwrap();
        assert_eq!(posted.payload.author_id, "u9");
        let (bucket, path, _) = fake.uploads.lock().unwrap()[0].clone();
        assert_eq!(bucket, NEWS_IMAGES_BUCKET);
        assert!(!path.contains('/'));

        assert!(
            eventually(|| async {
                board
                    .items()
                    .first()
                    .map(|n| n.id == posted.id && n.author_name() == "Sarpanch ji")
                    .unwrap_or(false)
            })
            .await
        );
        let (_, row) = fake.inserted.lock().unwrap()[0].clone();
        assert!(row.get("category").is_none());
    }

    #[tokio::test]
    async fn title_and_content_are_required() {
        init_test_logger();
        let fake = FakeBackend::new();
        fake.sign_in("u9");
        let board = NewsBoard::new(fake.backend(), RecordingListener::new());
        assert!(matches!(
            board.post_news("Notice", "  ", None).await,
            Err(SyncError::InvalidInput(_))
        ));
        assert!(matches!(
            board.post_news("", "body", None).await,
            Err(SyncError::InvalidInput(_))
        ));
        assert!(fake.inserted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_the_author_may_delete() {
        init_test_logger();
        let fake = FakeBackend::new();
        fake.sign_in("u2");
        fake.seed(
            "news",
            json!({
                "id": "n1",
                "created_at": "2024-01-26T05:00:00Z",
                "author_id": "u1",
                "title": "Republic Day",
                "content": "Parade at school ground"
            }),
        );
        let board = NewsBoard::new(fake.backend(), RecordingListener::new());
        board.open().await.unwrap();
        assert!(!board.can_delete(&board.items()[0]));
        assert!(matches!(
            board.delete_news("n1").await,
            Err(SyncError::PermissionDenied { .. })
        ));
        assert!(fake.deleted.lock().unwrap().is_empty());
    }
}
