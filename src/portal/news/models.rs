use crate::portal::backend::{JoinSpec, SortDirection};
use crate::portal::serialization::deserialize_null_default;
use crate::portal::sync::models::{Entity, Record};
use serde::{Deserialize, Serialize};

/// 村务新闻
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub author_id: String,
    pub title: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    /// 分类由服务器端维护，发布时不填
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Entity for NewsItem {
    const COLLECTION: &'static str = "news";
    const OWNER_FIELD: &'static str = "author_id";
    const DIRECTION: SortDirection = SortDirection::Descending;
    const LOG_TAG: &'static str = "[NewsSync]";

    fn owner_id(&self) -> &str {
        &self.author_id
    }

    fn join() -> Option<JoinSpec> {
        Some(JoinSpec::profiles("author_id", &["full_name"]))
    }
}

pub type NewsRecord = Record<NewsItem>;
