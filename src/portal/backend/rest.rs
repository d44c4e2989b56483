//! 托管后端 HTTP 客户端
//!
//! 表接口采用 PostgREST 风格（`/rest/v1/<table>`），文件存储走
//! `/storage/v1/object/<bucket>/<path>`。

use crate::portal::auth::SessionStore;
use crate::portal::backend::{DataAccess, FetchQuery, Filter, JoinSpec, SortDirection};
use crate::portal::types::handle_http_response;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

/// 托管后端的数据访问实现
pub struct RestDataAccess {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
    sessions: SessionStore,
}

impl RestDataAccess {
    /// 创建 REST 客户端
    ///
    /// `client` 应该已经通过 default_headers 带上 `apikey`
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        anon_key: String,
        sessions: SessionStore,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key,
            sessions,
        }
    }

    fn table_url(&self, collection: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection)
    }

    /// 已登录时使用用户 token，否则使用匿名 key
    fn bearer(&self) -> String {
        self.sessions
            .access_token()
            .unwrap_or_else(|| self.anon_key.clone())
    }

    async fn send(&self, request: reqwest::RequestBuilder, operation: &str) -> Result<Value> {
        let operation_id = Uuid::new_v4().to_string();
        debug!("[RestAPI]   {} 操作ID: {}", operation, operation_id);

        let response = request
            .bearer_auth(self.bearer())
            .header("x-operation-id", &operation_id)
            .send()
            .await
            .context(format!("{}请求失败", operation))?;

        handle_http_response(response, operation).await
    }
}

/// `select` 参数：`*` 或带作者联表的 `*,profiles:user_id(full_name,avatar_url)`
pub(crate) fn build_select(join: Option<&JoinSpec>) -> String {
    match join {
        Some(join) => format!(
            "*,{}:{}({})",
            join.alias,
            join.local_field,
            join.fields.join(",")
        ),
        None => "*".to_string(),
    }
}

/// 过滤条件转为查询参数（`field=eq.value`）
pub(crate) fn filter_params(filter: &Filter) -> Vec<(String, String)> {
    filter
        .conditions()
        .iter()
        .map(|(field, value)| {
            let op = match value {
                Value::Null => "is.null".to_string(),
                Value::String(s) => format!("eq.{}", s),
                other => format!("eq.{}", other),
            };
            (field.clone(), op)
        })
        .collect()
}

/// 排序参数，`id` 作为同一时间戳下的稳定次序
pub(crate) fn order_param(direction: SortDirection) -> String {
    let dir = direction.as_query();
    format!("created_at.{dir},id.{dir}", dir = dir)
}

fn first_row(value: Value, collection: &str) -> Result<Value> {
    match value {
        Value::Array(mut rows) if !rows.is_empty() => Ok(rows.swap_remove(0)),
        Value::Object(_) => Ok(value),
        _ => Err(anyhow::anyhow!("{} 写入后未返回记录（记录不存在或无权限）", collection)),
    }
}

#[async_trait]
impl DataAccess for RestDataAccess {
    async fn fetch_many(&self, collection: &str, query: &FetchQuery) -> Result<Vec<Value>> {
        let url = self.table_url(collection);
        let mut params = vec![
            ("select".to_string(), build_select(query.join.as_ref())),
            ("order".to_string(), order_param(query.direction)),
        ];
        params.extend(filter_params(&query.filter));

        info!("[RestAPI] 📡 拉取 {}", collection);
        debug!("[RestAPI]   请求URL: {}，参数: {:?}", url, params);

        let body = self
            .send(self.client.get(&url).query(&params), &format!("拉取{}", collection))
            .await?;

        let rows = match body {
            Value::Array(rows) => rows,
            Value::Null => Vec::new(),
            other => return Err(anyhow::anyhow!("拉取 {} 返回了非数组: {}", collection, other)),
        };
        info!("[RestAPI] ✅ 拉取 {} 完成，共 {} 条", collection, rows.len());
        Ok(rows)
    }

    async fn insert_one(&self, collection: &str, payload: Value) -> Result<Value> {
        let url = self.table_url(collection);
        info!("[RestAPI] 📡 新增 {} 记录", collection);

        let body = self
            .send(
                self.client
                    .post(&url)
                    .header("Prefer", "return=representation")
                    .json(&payload),
                &format!("新增{}", collection),
            )
            .await?;
        first_row(body, collection)
    }

    async fn update_one(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
        let url = self.table_url(collection);
        info!("[RestAPI] 📡 更新 {} 记录 {}", collection, id);

        let body = self
            .send(
                self.client
                    .patch(&url)
                    .query(&[("id", format!("eq.{}", id))])
                    .header("Prefer", "return=representation")
                    .json(&patch),
                &format!("更新{}", collection),
            )
            .await?;
        first_row(body, collection).map(|_| ())
    }

    async fn delete_one(&self, collection: &str, id: &str) -> Result<()> {
        let url = self.table_url(collection);
        info!("[RestAPI] 📡 删除 {} 记录 {}", collection, id);

        let body = self
            .send(
                self.client
                    .delete(&url)
                    .query(&[("id", format!("eq.{}", id))])
                    .header("Prefer", "return=representation"),
                &format!("删除{}", collection),
            )
            .await?;
        first_row(body, collection).map(|_| ())
    }

    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path);
        info!(
            "[RestAPI] 📦 上传文件 {}/{}（{} 字节）",
            bucket,
            path,
            bytes.len()
        );

        self.send(
            self.client
                .post(&url)
                .header("Content-Type", content_type)
                .header("x-upsert", "false")
                .body(bytes),
            "上传文件",
        )
        .await?;

        Ok(self.public_url(bucket, path))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, bucket, path
        )
    }
}
