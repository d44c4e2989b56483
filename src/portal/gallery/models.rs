use crate::portal::backend::{JoinSpec, SortDirection};
use crate::portal::serialization::deserialize_null_default;
use crate::portal::sync::models::{Entity, Record};
use serde::{Deserialize, Serialize};

/// 照片墙条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryItem {
    pub user_id: String,
    pub title: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub description: String,
    pub image_url: String,
}

impl Entity for GalleryItem {
    const COLLECTION: &'static str = "gallery_items";
    const OWNER_FIELD: &'static str = "user_id";
    const DIRECTION: SortDirection = SortDirection::Descending;
    const LOG_TAG: &'static str = "[GallerySync]";

    fn owner_id(&self) -> &str {
        &self.user_id
    }

    fn join() -> Option<JoinSpec> {
        Some(JoinSpec::profiles("user_id", &["full_name", "avatar_url"]))
    }
}

/// 编辑照片说明（图片本身不可替换）
#[derive(Debug, Clone, Serialize)]
pub struct GalleryEdit {
    pub title: String,
    pub description: String,
}

pub type GalleryRecord = Record<GalleryItem>;
