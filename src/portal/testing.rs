//! 测试辅助：内存假后端、测试实体、记录型监听器

use crate::portal::backend::{
    Backend, ChangeSink, CurrentUser, DataAccess, FetchQuery, Identity, JoinSpec,
    PushSubscription, RawChange, SortDirection, SubscriptionHandle,
};
use crate::portal::sync::listener::SyncListener;
use crate::portal::sync::models::{Entity, Record};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 测试用实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub user_id: String,
    pub body: String,
    #[serde(default)]
    pub pinned: bool,
}

impl Entity for Note {
    const COLLECTION: &'static str = "notes";
    const OWNER_FIELD: &'static str = "user_id";
    const DIRECTION: SortDirection = SortDirection::Ascending;
    const LOG_TAG: &'static str = "[NoteSync]";

    fn owner_id(&self) -> &str {
        &self.user_id
    }

    fn join() -> Option<JoinSpec> {
        Some(JoinSpec::profiles("user_id", &["full_name", "avatar_url"]))
    }
}

pub fn note_row(id: &str, created_at: &str, user_id: &str, body: &str) -> Value {
    json!({"id": id, "created_at": created_at, "user_id": user_id, "body": body})
}

pub fn note(id: &str, created_at: &str, user_id: &str, body: &str) -> Record<Note> {
    serde_json::from_value(note_row(id, created_at, user_id, body)).expect("valid note row")
}

pub fn init_test_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// 轮询直到条件成立（最多约 2 秒）
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// 内存假后端：可控制失败、延迟和是否回推写操作
#[derive(Default)]
pub struct FakeBackend {
    rows: Mutex<HashMap<String, Vec<Value>>>,
    sinks: Mutex<Vec<(SubscriptionHandle, ChangeSink)>>,
    user: Mutex<Option<CurrentUser>>,
    lookup_delay: Mutex<Duration>,
    fetch_delay: Mutex<Duration>,
    next_id: AtomicU64,
    pub fail_fetch: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub fail_mutations: AtomicBool,
    pub fail_lookups: AtomicBool,
    /// 写成功后自动推送对应事件
    pub echo_writes: AtomicBool,
    pub inserted: Mutex<Vec<(String, Value)>>,
    pub updated: Mutex<Vec<(String, String, Value)>>,
    pub deleted: Mutex<Vec<(String, String)>>,
    pub uploads: Mutex<Vec<(String, String, String)>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn backend(self: &Arc<Self>) -> Backend {
        Backend::new(self.clone(), self.clone(), self.clone())
    }

    pub fn sign_in(&self, user_id: &str) {
        *self.user.lock().unwrap() = Some(CurrentUser {
            id: user_id.to_string(),
            email: Some(format!("{}@village.test", user_id)),
        });
    }

    pub fn sign_out(&self) {
        *self.user.lock().unwrap() = None;
    }

    pub fn set_lookup_delay(&self, delay: Duration) {
        *self.lookup_delay.lock().unwrap() = delay;
    }

    /// 非 profiles 集合的拉取在取到快照后再延迟返回
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub fn seed(&self, collection: &str, row: Value) {
        self.rows
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .push(row);
    }

    pub fn seed_profile(&self, user_id: &str, full_name: &str) {
        self.seed(
            "profiles",
            json!({"id": user_id, "full_name": full_name, "avatar_url": null, "is_admin": false}),
        );
    }

    pub fn row(&self, collection: &str, id: &str) -> Option<Value> {
        self.rows
            .lock()
            .unwrap()
            .get(collection)?
            .iter()
            .find(|r| r["id"] == json!(id))
            .cloned()
    }

    /// 向订阅了该集合的接收端推送事件
    pub fn emit(&self, change: RawChange) {
        let sinks = self.sinks.lock().unwrap();
        for (handle, sink) in sinks.iter() {
            if handle.collection == change.collection {
                let _ = sink.send(change.clone());
            }
        }
    }

    /// 推送给所有订阅者（不区分集合）
    pub fn emit_to_all(&self, change: RawChange) {
        for (_, sink) in self.sinks.lock().unwrap().iter() {
            let _ = sink.send(change.clone());
        }
    }

    /// 模拟连接断开
    pub fn drop_subscriptions(&self) {
        self.sinks.lock().unwrap().clear();
    }

    pub fn subscriber_count(&self, collection: &str) -> usize {
        self.sinks
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, sink)| h.collection == collection && !sink.is_closed())
            .count()
    }

    fn attach_join(&self, rows: &mut [Value], join: &JoinSpec) {
        let all = self.rows.lock().unwrap();
        let profiles = all.get(&join.collection).cloned().unwrap_or_default();
        for row in rows.iter_mut() {
            let owner = row.get(&join.local_field).cloned().unwrap_or(Value::Null);
            let embedded = profiles
                .iter()
                .find(|p| p["id"] == owner)
                .map(|p| {
                    let picked: Map<String, Value> = join
                        .fields
                        .iter()
                        .map(|f| (f.clone(), p.get(f).cloned().unwrap_or(Value::Null)))
                        .collect();
                    Value::Object(picked)
                })
                .unwrap_or(Value::Null);
            if let Value::Object(map) = row {
                map.insert(join.alias.clone(), embedded);
            }
        }
    }
}

#[async_trait]
impl DataAccess for FakeBackend {
    async fn fetch_many(&self, collection: &str, query: &FetchQuery) -> Result<Vec<Value>> {
        if collection == "profiles" {
            if self.fail_lookups.load(Ordering::SeqCst) {
                bail!("profiles 查询失败（模拟）");
            }
            let delay = *self.lookup_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        } else if self.fail_fetch.load(Ordering::SeqCst) {
            bail!("网络不可用（模拟）");
        }

        let mut rows: Vec<Value> = self
            .rows
            .lock()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|r| query.filter.matches(r))
            .collect();
        rows.sort_by(|a, b| {
            let key = |r: &Value| {
                (
                    r["created_at"].as_str().unwrap_or_default().to_string(),
                    r["id"].as_str().unwrap_or_default().to_string(),
                )
            };
            let ord = key(a).cmp(&key(b));
            match query.direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            }
        });
        if let Some(join) = &query.join {
            self.attach_join(&mut rows, join);
        }

        let delay = *self.fetch_delay.lock().unwrap();
        if collection != "profiles" && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(rows)
    }

    async fn insert_one(&self, collection: &str, payload: Value) -> Result<Value> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            bail!("写入被拒绝（模拟）");
        }
        let Value::Object(mut row) = payload else {
            bail!("payload 必须是对象");
        };
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        row.insert("id".to_string(), json!(format!("srv-{}", n)));
        row.entry("created_at".to_string()).or_insert_with(|| {
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
        });
        let row = Value::Object(row);

        self.inserted
            .lock()
            .unwrap()
            .push((collection.to_string(), row.clone()));
        self.seed(collection, row.clone());
        if self.echo_writes.load(Ordering::SeqCst) {
            self.emit(RawChange::insert(collection, row.clone()));
        }
        Ok(row)
    }

    async fn update_one(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            bail!("更新被拒绝（模拟）");
        }
        self.updated
            .lock()
            .unwrap()
            .push((collection.to_string(), id.to_string(), patch.clone()));

        let after = {
            let mut all = self.rows.lock().unwrap();
            let rows = all.entry(collection.to_string()).or_default();
            let Some(row) = rows.iter_mut().find(|r| r["id"] == json!(id)) else {
                bail!("记录不存在: {}", id);
            };
            if let (Value::Object(target), Value::Object(patch)) = (row, patch) {
                for (k, v) in patch {
                    target.insert(k, v);
                }
                Value::Object(target.clone())
            } else {
                bail!("patch 必须是对象");
            }
        };
        if self.echo_writes.load(Ordering::SeqCst) {
            self.emit(RawChange::update(collection, None, after));
        }
        Ok(())
    }

    async fn delete_one(&self, collection: &str, id: &str) -> Result<()> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            bail!("删除被拒绝（模拟）");
        }
        self.deleted
            .lock()
            .unwrap()
            .push((collection.to_string(), id.to_string()));
        let removed = {
            let mut all = self.rows.lock().unwrap();
            let rows = all.entry(collection.to_string()).or_default();
            let before = rows.len();
            rows.retain(|r| r["id"] != json!(id));
            before != rows.len()
        };
        if !removed {
            bail!("记录不存在: {}", id);
        }
        if self.echo_writes.load(Ordering::SeqCst) {
            self.emit(RawChange::delete(collection, json!({ "id": id })));
        }
        Ok(())
    }

    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        _bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            bail!("上传被拒绝（模拟）");
        }
        self.uploads.lock().unwrap().push((
            bucket.to_string(),
            path.to_string(),
            content_type.to_string(),
        ));
        Ok(self.public_url(bucket, path))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("https://files.test/{}/{}", bucket, path)
    }
}

#[async_trait]
impl PushSubscription for FakeBackend {
    async fn subscribe(&self, collection: &str, sink: ChangeSink) -> Result<SubscriptionHandle> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            bail!("订阅失败（模拟）");
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = SubscriptionHandle {
            id: format!("sub-{}", n),
            collection: collection.to_string(),
        };
        self.sinks.lock().unwrap().push((handle.clone(), sink));
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.sinks.lock().unwrap().retain(|(h, _)| *h != handle);
        Ok(())
    }
}

impl Identity for FakeBackend {
    fn current_user(&self) -> Option<CurrentUser> {
        self.user.lock().unwrap().clone()
    }
}

/// 记录所有回调，便于断言
#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.events().iter().any(|e| e.starts_with(prefix))
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl SyncListener for RecordingListener {
    async fn on_sync_start(&self, collection: &str) {
        self.push(format!("start:{}", collection));
    }

    async fn on_sync_finish(&self, collection: &str, total: usize) {
        self.push(format!("finish:{}:{}", collection, total));
    }

    async fn on_sync_failed(&self, collection: &str, reason: String) {
        self.push(format!("failed:{}:{}", collection, reason));
    }

    async fn on_record_inserted(&self, _collection: &str, index: usize, record_json: String) {
        let id = serde_json::from_str::<Value>(&record_json)
            .ok()
            .and_then(|v| v["id"].as_str().map(str::to_owned))
            .unwrap_or_default();
        self.push(format!("inserted:{}:{}", index, id));
    }

    async fn on_record_updated(&self, _collection: &str, index: usize, record_json: String) {
        let id = serde_json::from_str::<Value>(&record_json)
            .ok()
            .and_then(|v| v["id"].as_str().map(str::to_owned))
            .unwrap_or_default();
        self.push(format!("updated:{}:{}", index, id));
    }

    async fn on_record_deleted(&self, _collection: &str, id: String) {
        self.push(format!("deleted:{}", id));
    }

    async fn on_subscription_lost(&self, collection: &str) {
        self.push(format!("lost:{}", collection));
    }
}
