//! 同步器错误类型

use std::fmt;
use thiserror::Error;

/// 写操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    Upload,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationKind::Create => "新增",
            MutationKind::Update => "更新",
            MutationKind::Delete => "删除",
            MutationKind::Upload => "上传",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// 首次批量拉取失败，列表保持为空
    #[error("拉取 {collection} 失败: {source:#}")]
    Fetch {
        collection: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("订阅 {collection} 失败: {source:#}")]
    Subscribe {
        collection: String,
        #[source]
        source: anyhow::Error,
    },

    /// 写请求被拒绝，本地列表不受影响
    #[error("{op} {collection} 失败: {source:#}")]
    Mutation {
        collection: String,
        op: MutationKind,
        #[source]
        source: anyhow::Error,
    },

    /// 作者资料查询失败，只记录日志，作者保持为空
    #[error("查询用户 {user_id} 资料失败: {source:#}")]
    Lookup {
        user_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("未登录")]
    NotSignedIn,

    #[error("无权修改 {collection} 记录 {id}")]
    PermissionDenied { collection: String, id: String },

    #[error("参数无效: {0}")]
    InvalidInput(String),
}

impl SyncError {
    pub fn mutation(collection: &str, op: MutationKind, source: anyhow::Error) -> Self {
        SyncError::Mutation {
            collection: collection.to_string(),
            op,
            source,
        }
    }

    /// 是否是写请求失败（调用方展示行内错误即可）
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            SyncError::Mutation { .. } | SyncError::PermissionDenied { .. } | SyncError::NotSignedIn
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
