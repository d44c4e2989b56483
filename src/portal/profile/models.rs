use crate::portal::serialization::deserialize_null_default;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 用户资料（`profiles` 表，`id` 即用户 ID）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub is_admin: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Profile {
    /// 名字为空视为尚未完成引导
    pub fn has_name(&self) -> bool {
        self.full_name
            .as_deref()
            .map(|n| !n.trim().is_empty())
            .unwrap_or(false)
    }
}

/// 资料更新内容
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ProfilePatch {
    pub full_name: String,
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}
