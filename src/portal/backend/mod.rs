//! 后端协作者接口
//!
//! 同步器只依赖这里定义的三个接口：数据访问、推送订阅、身份。
//! 具体实现：
//! - [`rest::RestDataAccess`]：托管后端的 HTTP 表接口 + 文件存储
//! - [`realtime::RealtimeClient`]：托管后端的实时变更推送（WebSocket）
//! - [`local::SqliteBackend`]：本地 SQLite 实现（离线/开发模式）

pub mod local;
pub mod realtime;
pub mod rest;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// 排序方向（按 `(created_at, id)`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// REST 查询中的排序后缀
    pub fn as_query(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "asc",
            SortDirection::Descending => "desc",
        }
    }
}

/// 等值过滤条件（多个条件之间为 AND）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个 `field = value` 条件
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// 判断一行数据是否满足全部条件
    ///
    /// 缺失字段按 null 处理。
    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|(field, expected)| {
            let actual = row.get(field).unwrap_or(&Value::Null);
            actual == expected
        })
    }
}

/// 作者资料联表说明
///
/// `local_field` 指向当前表中保存用户 ID 的列，关联 `collection` 表的 `id` 列，
/// 结果以 `alias` 字段嵌入每一行。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSpec {
    pub collection: String,
    pub alias: String,
    pub local_field: String,
    pub fields: Vec<String>,
}

impl JoinSpec {
    /// 关联 `profiles` 表
    pub fn profiles(local_field: &str, fields: &[&str]) -> Self {
        Self {
            collection: "profiles".to_string(),
            alias: "profiles".to_string(),
            local_field: local_field.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// 批量拉取参数
#[derive(Debug, Clone)]
pub struct FetchQuery {
    pub filter: Filter,
    pub direction: SortDirection,
    pub join: Option<JoinSpec>,
}

impl FetchQuery {
    pub fn new(direction: SortDirection) -> Self {
        Self {
            filter: Filter::new(),
            direction,
            join: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_join(mut self, join: Option<JoinSpec>) -> Self {
        self.join = join;
        self
    }
}

/// 推送事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// 服务器推送的原始变更事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub kind: ChangeKind,
    pub collection: String,
    #[serde(default)]
    pub before: Option<Value>,
    #[serde(default)]
    pub after: Option<Value>,
}

impl RawChange {
    pub fn insert(collection: &str, row: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            collection: collection.to_string(),
            before: None,
            after: Some(row),
        }
    }

    pub fn update(collection: &str, before: Option<Value>, after: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            collection: collection.to_string(),
            before,
            after: Some(after),
        }
    }

    pub fn delete(collection: &str, before: Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            collection: collection.to_string(),
            before: Some(before),
            after: None,
        }
    }
}

/// 推送事件接收端；发送端被丢弃即表示订阅已断开
pub type ChangeSink = mpsc::UnboundedSender<RawChange>;

/// 订阅句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: String,
    pub collection: String,
}

/// 当前登录用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// 数据访问接口（请求/响应）
#[async_trait]
pub trait DataAccess: Send + Sync {
    /// 批量拉取，返回按 `(created_at, id)` 排好序的原始行
    async fn fetch_many(&self, collection: &str, query: &FetchQuery) -> Result<Vec<Value>>;

    /// 插入一行，返回服务器生成的完整行（含 id / created_at）
    async fn insert_one(&self, collection: &str, payload: Value) -> Result<Value>;

    /// 按 id 局部更新；记录不存在或无权限时报错
    async fn update_one(&self, collection: &str, id: &str, patch: Value) -> Result<()>;

    /// 按 id 删除；记录不存在或无权限时报错
    async fn delete_one(&self, collection: &str, id: &str) -> Result<()>;

    /// 上传文件，返回公开访问地址
    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String>;

    /// 文件的公开访问地址
    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// 推送订阅接口
#[async_trait]
pub trait PushSubscription: Send + Sync {
    async fn subscribe(&self, collection: &str, sink: ChangeSink) -> Result<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;
}

/// 身份接口
pub trait Identity: Send + Sync {
    fn current_user(&self) -> Option<CurrentUser>;
}

/// 一组后端协作者，构造同步器和业务服务时显式传入
#[derive(Clone)]
pub struct Backend {
    pub data: Arc<dyn DataAccess>,
    pub push: Arc<dyn PushSubscription>,
    pub identity: Arc<dyn Identity>,
}

impl Backend {
    pub fn new(
        data: Arc<dyn DataAccess>,
        push: Arc<dyn PushSubscription>,
        identity: Arc<dyn Identity>,
    ) -> Self {
        Self {
            data,
            push,
            identity,
        }
    }
}
