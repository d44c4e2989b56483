//! 附件上传

use crate::portal::backend::DataAccess;
use crate::portal::serialization::object_path;
use crate::portal::sync::error::{MutationKind, Result, SyncError};
use crate::portal::sync::service::with_timeout;
use anyhow::Context;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// 待上传的文件
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl MediaUpload {
    pub fn new(file_name: &str, content_type: &str, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            bytes,
        }
    }

    /// 读取本地文件，按扩展名推断 MIME 类型
    pub async fn from_path(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .context(format!("读取文件失败: {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self {
            file_name,
            content_type,
            bytes,
        })
    }
}

/// 上传到 `bucket`，路径为 `[<prefix>/]<uuid>.<ext>`，返回公开地址
pub async fn upload_media(
    data: &dyn DataAccess,
    bucket: &str,
    prefix: Option<&str>,
    media: MediaUpload,
    limit: Duration,
) -> Result<String> {
    if media.bytes.is_empty() {
        return Err(SyncError::InvalidInput(format!(
            "文件 {} 为空",
            media.file_name
        )));
    }
    let path = object_path(prefix, &media.file_name);
    info!("[Storage] 📦 上传 {} → {}/{}", media.file_name, bucket, path);

    with_timeout(
        limit,
        data.upload_blob(bucket, &path, media.bytes, &media.content_type),
    )
    .await
    .map_err(|source| {
        warn!("[Storage] 上传 {} 失败: {:#}", media.file_name, source);
        SyncError::Mutation {
            collection: bucket.to_string(),
            op: MutationKind::Upload,
            source,
        }
    })
}
