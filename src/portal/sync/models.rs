//! 同步器数据模型

use crate::portal::backend::{ChangeKind, Filter, JoinSpec, RawChange, SortDirection};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::time::Duration;

/// 作者资料缺失时显示的名字
pub const UNKNOWN_AUTHOR: &str = "Unknown User";

/// 默认请求超时
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// 联表得到的作者资料快照（只读，非权威）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// 客户端侧的修改权限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPolicy {
    /// 只有创建者可以修改/删除
    OwnerOnly,
    /// 由管理员审核，客户端不做归属检查（服务器负责鉴权）
    Moderated,
}

/// 可同步的实体
///
/// `Self` 是实体自身的字段（payload），通用字段 `id` / `created_at` / 作者
/// 由 [`Record`] 承载。
pub trait Entity: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// 服务器表名
    const COLLECTION: &'static str;
    /// 保存创建者 ID 的列
    const OWNER_FIELD: &'static str;
    /// 默认排序方向
    const DIRECTION: SortDirection;
    /// 日志标签，例如 `[ChatSync]`
    const LOG_TAG: &'static str;
    const POLICY: MutationPolicy = MutationPolicy::OwnerOnly;

    fn owner_id(&self) -> &str;

    /// 作者资料联表，`None` 表示该实体不展示作者
    fn join() -> Option<JoinSpec> {
        None
    }
}

/// 一条服务器记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<E> {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "profiles", default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(flatten)]
    pub payload: E,
}

impl<E: Entity> Record<E> {
    pub fn owner_id(&self) -> &str {
        self.payload.owner_id()
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id() == user_id
    }

    /// 作者显示名，缺失时为 "Unknown User"
    pub fn author_name(&self) -> &str {
        self.author
            .as_ref()
            .and_then(|a| a.full_name.as_deref())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(UNKNOWN_AUTHOR)
    }

    pub fn author_avatar(&self) -> Option<&str> {
        self.author.as_ref().and_then(|a| a.avatar_url.as_deref())
    }

    /// 排序键 `(created_at, id)`
    pub(crate) fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// 解码后的推送事件
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<E> {
    Insert(Record<E>),
    Update(Record<E>),
    Delete(String),
}

impl<E: Entity> ChangeEvent<E> {
    pub fn decode(raw: &RawChange) -> anyhow::Result<Self> {
        match raw.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let row = raw
                    .after
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("{:?} 事件缺少新数据", raw.kind))?;
                let record: Record<E> = serde_json::from_value(row)
                    .context(format!("解析 {} 记录失败", raw.collection))?;
                Ok(if raw.kind == ChangeKind::Insert {
                    ChangeEvent::Insert(record)
                } else {
                    ChangeEvent::Update(record)
                })
            }
            ChangeKind::Delete => {
                let id = raw
                    .before
                    .as_ref()
                    .and_then(|row| row.get("id"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("DELETE 事件缺少 id"))?;
                Ok(ChangeEvent::Delete(id.to_string()))
            }
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ChangeEvent::Insert(r) | ChangeEvent::Update(r) => &r.id,
            ChangeEvent::Delete(id) => id,
        }
    }
}

/// 同步器配置
#[derive(Debug, Clone)]
pub struct ListSyncerConfig {
    /// 服务器表名
    pub collection: String,
    pub direction: SortDirection,
    /// 只同步满足条件的记录
    pub filter: Filter,
    pub join: Option<JoinSpec>,
    /// 批量拉取、写请求、作者查询的超时
    pub request_timeout: Duration,
    pub log_tag: String,
}

impl ListSyncerConfig {
    /// 按实体的默认设置创建配置
    pub fn for_entity<E: Entity>() -> Self {
        Self {
            collection: E::COLLECTION.to_string(),
            direction: E::DIRECTION,
            filter: Filter::new(),
            join: E::join(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            log_tag: E::LOG_TAG.to_string(),
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_log_tag(mut self, tag: &str) -> Self {
        self.log_tag = tag.to_string();
        self
    }
}
