//! 本地 SQLite 后端
//!
//! 同时实现 [`DataAccess`] 和 [`PushSubscription`]：每次写入成功后，
//! 在进程内把变更推送给订阅了同一集合的接收端，行为上与托管后端的
//! 实时变更推送一致。用于离线/开发模式和集成测试。

use crate::portal::backend::{
    ChangeSink, DataAccess, FetchQuery, JoinSpec, PushSubscription, RawChange, SortDirection,
    SubscriptionHandle,
};
use crate::portal::db::create_sqlite_pool_with_migration;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 本地文件的公开地址前缀
pub const LOCAL_STORAGE_BASE: &str = "local://storage";

struct LocalRoute {
    collection: String,
    sink: ChangeSink,
}

/// 本地 SQLite 后端
pub struct SqliteBackend {
    db: Pool<Sqlite>,
    routes: Mutex<HashMap<String, LocalRoute>>,
    storage_base: String,
}

impl SqliteBackend {
    /// 打开（必要时创建）数据库并执行迁移
    pub async fn open(db_url: &str) -> Result<Self> {
        let db = create_sqlite_pool_with_migration(db_url).await?;
        Ok(Self::with_pool(db))
    }

    /// 使用已迁移好的连接池
    pub fn with_pool(db: Pool<Sqlite>) -> Self {
        Self {
            db,
            routes: Mutex::new(HashMap::new()),
            storage_base: LOCAL_STORAGE_BASE.to_string(),
        }
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<String, LocalRoute>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 推送给同一集合的所有订阅者，顺带清理已关闭的接收端
    fn broadcast(&self, change: RawChange) {
        let mut routes = self.routes();
        routes.retain(|id, route| {
            if route.collection != change.collection {
                return true;
            }
            if route.sink.send(change.clone()).is_err() {
                debug!("[LocalDB] 订阅 {} 的接收端已关闭，移除", id);
                return false;
            }
            true
        });
    }

    /// 断开所有订阅（接收端会收到通道关闭），模拟连接中断
    pub fn disconnect_all(&self) -> usize {
        let mut routes = self.routes();
        let count = routes.len();
        routes.clear();
        warn!("[LocalDB] 已断开全部 {} 个订阅", count);
        count
    }

    /// 当前订阅了某集合的接收端数量
    pub fn subscriber_count(&self, collection: &str) -> usize {
        self.routes()
            .values()
            .filter(|r| r.collection == collection)
            .count()
    }

    async fn find_row(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query(
            r#"
            SELECT body FROM local_records
            WHERE collection = ? AND id = ?
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context(format!("查询 {} 记录失败", collection))?;

        match row {
            Some(row) => {
                let body: String = row.get("body");
                Ok(Some(
                    serde_json::from_str(&body).context("解析本地记录 JSON 失败")?,
                ))
            }
            None => Ok(None),
        }
    }

    /// 按联表说明把作者资料嵌入每一行（找不到时为 null）
    async fn attach_join(&self, rows: &mut [Value], join: &JoinSpec) -> Result<()> {
        let mut cache: HashMap<String, Value> = HashMap::new();
        for row in rows.iter_mut() {
            let owner = row
                .get(&join.local_field)
                .and_then(Value::as_str)
                .map(str::to_owned);
            let embedded = match owner {
                Some(owner) => {
                    if let Some(hit) = cache.get(&owner) {
                        hit.clone()
                    } else {
                        let resolved = match self.find_row(&join.collection, &owner).await? {
                            Some(profile) => {
                                let mut picked = Map::new();
                                for field in &join.fields {
                                    picked.insert(
                                        field.clone(),
                                        profile.get(field).cloned().unwrap_or(Value::Null),
                                    );
                                }
                                Value::Object(picked)
                            }
                            None => Value::Null,
                        };
                        cache.insert(owner, resolved.clone());
                        resolved
                    }
                }
                None => Value::Null,
            };
            if let Value::Object(map) = row {
                map.insert(join.alias.clone(), embedded);
            }
        }
        Ok(())
    }

    /// 读取已上传的文件，返回 (content_type, bytes)
    pub async fn read_blob(&self, bucket: &str, path: &str) -> Result<Option<(String, Vec<u8>)>> {
        let row = sqlx::query(
            r#"
            SELECT content_type, bytes FROM local_blobs
            WHERE bucket = ? AND path = ?
            "#,
        )
        .bind(bucket)
        .bind(path)
        .fetch_optional(&self.db)
        .await
        .context("查询本地文件失败")?;

        Ok(row.map(|r| (r.get("content_type"), r.get("bytes"))))
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl DataAccess for SqliteBackend {
    async fn fetch_many(&self, collection: &str, query: &FetchQuery) -> Result<Vec<Value>> {
        let dir = match query.direction {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        };
        let sql = format!(
            "SELECT body FROM local_records WHERE collection = ? ORDER BY created_at {dir}, id {dir}",
            dir = dir
        );
        let rows = sqlx::query(&sql)
            .bind(collection)
            .fetch_all(&self.db)
            .await
            .context(format!("查询 {} 列表失败", collection))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.get("body");
            let value: Value = serde_json::from_str(&body).context("解析本地记录 JSON 失败")?;
            if query.filter.matches(&value) {
                out.push(value);
            }
        }

        if let Some(join) = &query.join {
            self.attach_join(&mut out, join).await?;
        }

        debug!("[LocalDB] 拉取 {}，共 {} 条", collection, out.len());
        Ok(out)
    }

    async fn insert_one(&self, collection: &str, payload: Value) -> Result<Value> {
        let Value::Object(mut row) = payload else {
            bail!("插入 {} 的内容必须是 JSON 对象", collection);
        };

        let id = match row.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let created_at = row
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(now_timestamp);
        row.insert("id".to_string(), Value::String(id.clone()));
        row.insert("created_at".to_string(), Value::String(created_at.clone()));
        let body = Value::Object(row);

        sqlx::query(
            r#"
            INSERT INTO local_records (collection, id, created_at, body)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(collection)
        .bind(&id)
        .bind(&created_at)
        .bind(body.to_string())
        .execute(&self.db)
        .await
        .context(format!("插入 {} 记录失败", collection))?;

        info!("[LocalDB] ➕ {} 新增记录 {}", collection, id);
        self.broadcast(RawChange::insert(collection, body.clone()));
        Ok(body)
    }

    async fn update_one(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
        let Value::Object(patch) = patch else {
            bail!("更新 {} 的内容必须是 JSON 对象", collection);
        };
        let Some(before) = self.find_row(collection, id).await? else {
            bail!("记录不存在: {}/{}", collection, id);
        };

        let mut after = before.clone();
        if let Value::Object(map) = &mut after {
            for (key, value) in patch {
                // id / created_at 不可变
                if key == "id" || key == "created_at" {
                    continue;
                }
                map.insert(key, value);
            }
        }

        sqlx::query(
            r#"
            UPDATE local_records SET body = ?
            WHERE collection = ? AND id = ?
            "#,
        )
        .bind(after.to_string())
        .bind(collection)
        .bind(id)
        .execute(&self.db)
        .await
        .context(format!("更新 {} 记录失败", collection))?;

        info!("[LocalDB] ✏️ {} 更新记录 {}", collection, id);
        self.broadcast(RawChange::update(collection, Some(before), after));
        Ok(())
    }

    async fn delete_one(&self, collection: &str, id: &str) -> Result<()> {
        let Some(before) = self.find_row(collection, id).await? else {
            bail!("记录不存在: {}/{}", collection, id);
        };

        sqlx::query(
            r#"
            DELETE FROM local_records
            WHERE collection = ? AND id = ?
            "#,
        )
        .bind(collection)
        .bind(id)
        .execute(&self.db)
        .await
        .context(format!("删除 {} 记录失败", collection))?;

        info!("[LocalDB] 🗑️ {} 删除记录 {}", collection, id);
        self.broadcast(RawChange::delete(collection, before));
        Ok(())
    }

    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let size = bytes.len();
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO local_blobs (bucket, path, content_type, bytes, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(bucket)
        .bind(path)
        .bind(content_type)
        .bind(bytes)
        .bind(now_timestamp())
        .execute(&self.db)
        .await
        .context(format!("保存文件失败: {}/{}", bucket, path))?;

        info!("[LocalDB] 📦 保存文件 {}/{}（{} 字节）", bucket, path, size);
        Ok(self.public_url(bucket, path))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/{}/{}", self.storage_base, bucket, path)
    }
}

#[async_trait]
impl PushSubscription for SqliteBackend {
    async fn subscribe(&self, collection: &str, sink: ChangeSink) -> Result<SubscriptionHandle> {
        let id = Uuid::new_v4().to_string();
        self.routes().insert(
            id.clone(),
            LocalRoute {
                collection: collection.to_string(),
                sink,
            },
        );
        debug!("[LocalDB] 订阅 {}，订阅ID: {}", collection, id);
        Ok(SubscriptionHandle {
            id,
            collection: collection.to_string(),
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        if self.routes().remove(&handle.id).is_some() {
            debug!("[LocalDB] 取消订阅 {}，订阅ID: {}", handle.collection, handle.id);
        }
        Ok(())
    }
}
