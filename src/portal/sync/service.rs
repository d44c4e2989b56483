//! 实时列表同步服务
//!
//! 流程：订阅推送 → 批量拉取 → 启动事件处理任务。订阅先于拉取建立，
//! 拉取期间到达的事件在通道中排队，拉取完成后按顺序应用；事件本身是
//! 幂等的（插入已存在的 id 视为更新，删除不存在的 id 不做任何事），
//! 因此列表最终与服务器一致。
//!
//! 写操作只发请求，不直接修改本地列表，记录的出现/变化/消失都以推送
//! 回来的事件为准。

use crate::portal::backend::{
    Backend, CurrentUser, DataAccess, FetchQuery, Filter, JoinSpec, RawChange, SortDirection,
    SubscriptionHandle,
};
use crate::portal::sync::error::{MutationKind, Result, SyncError};
use crate::portal::sync::list::{Applied, OrderedList};
use crate::portal::sync::listener::{EmptySyncListener, SyncListener};
use crate::portal::sync::models::{
    Author, ChangeEvent, Entity, ListSyncerConfig, MutationPolicy, Record,
};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// 给远程调用加上超时
pub(crate) async fn with_timeout<T, F>(limit: Duration, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("请求超时（{:?}）", limit)),
    }
}

/// 查询单个用户的作者资料；资料不存在时返回 None
async fn lookup_author(
    data: &dyn DataAccess,
    join: &JoinSpec,
    user_id: &str,
    limit: Duration,
) -> Result<Option<Author>> {
    let query = FetchQuery::new(SortDirection::Ascending).with_filter(Filter::new().eq("id", user_id));
    let lookup_err = |source: anyhow::Error| SyncError::Lookup {
        user_id: user_id.to_string(),
        source,
    };
    let rows = with_timeout(limit, data.fetch_many(&join.collection, &query))
        .await
        .map_err(lookup_err)?;
    match rows.into_iter().next() {
        Some(row) => serde_json::from_value::<Author>(row)
            .map(Some)
            .map_err(|e| lookup_err(e.into())),
        None => Ok(None),
    }
}

struct SyncState<E> {
    list: OrderedList<E>,
    live: bool,
    /// initialize 和 teardown 都会加一，旧任务的结果据此丢弃
    generation: u64,
}

impl<E: Entity> SyncState<E> {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }
}

struct ActiveSession {
    handle: SubscriptionHandle,
    worker: JoinHandle<()>,
}

type LookupOutcome = (String, String, Result<Option<Author>>);

/// 事件处理任务的上下文
struct Worker<E> {
    generation: u64,
    config: ListSyncerConfig,
    data: Arc<dyn DataAccess>,
    listener: Arc<dyn SyncListener>,
    state: Arc<StdMutex<SyncState<E>>>,
}

impl<E: Entity> Worker<E> {
    fn state(&self) -> MutexGuard<'_, SyncState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self, mut rx: UnboundedReceiver<RawChange>) {
        let mut lookups: JoinSet<LookupOutcome> = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                Some(done) = lookups.join_next(), if !lookups.is_empty() => {
                    self.finish_lookup(done).await;
                }
                change = rx.recv() => match change {
                    Some(raw) => self.handle_change(raw, &mut lookups).await,
                    None => {
                        self.subscription_lost().await;
                        break;
                    }
                }
            }
        }
        // 订阅断开后仍把已发出的作者查询处理完
        while let Some(done) = lookups.join_next().await {
            self.finish_lookup(done).await;
        }
    }

    async fn handle_change(&self, raw: RawChange, lookups: &mut JoinSet<LookupOutcome>) {
        let tag = &self.config.log_tag;
        if raw.collection != self.config.collection {
            debug!("{} 忽略其他集合的事件: {}", tag, raw.collection);
            return;
        }
        let event = match ChangeEvent::<E>::decode(&raw) {
            Ok(event) => event,
            Err(e) => {
                warn!("{} 跳过无法解析的 {:?} 事件: {:#}", tag, raw.kind, e);
                return;
            }
        };
        let event_id = event.id().to_string();
        debug!("{} 📥 {:?} {}", tag, raw.kind, event_id);

        let mut pending_lookup = None;
        let (applied, snapshot) = {
            let mut state = self.state();
            if !state.is_current(self.generation) {
                return;
            }
            let applied = match event {
                ChangeEvent::Insert(record) | ChangeEvent::Update(record) => {
                    let matches = raw
                        .after
                        .as_ref()
                        .map(|row| self.config.filter.matches(row))
                        .unwrap_or(false);
                    if !matches {
                        state.list.remove(&record.id)
                    } else {
                        let is_new = state.list.position(&record.id).is_none();
                        if is_new && record.author.is_none() && self.config.join.is_some() {
                            pending_lookup =
                                Some((record.id.clone(), record.owner_id().to_string()));
                        }
                        state.list.upsert(record)
                    }
                }
                ChangeEvent::Delete(id) => state.list.remove(&id),
            };
            let snapshot = match applied {
                Applied::Inserted(idx) | Applied::Updated(idx) => state
                    .list
                    .records()
                    .get(idx)
                    .and_then(|r| serde_json::to_string(r).ok()),
                _ => None,
            };
            (applied, snapshot)
        };

        let collection = self.config.collection.as_str();
        match applied {
            Applied::Inserted(idx) => {
                info!("{} ➕ 新增记录 {}（位置 {}）", tag, event_id, idx);
                if let Some(json) = snapshot {
                    self.listener.on_record_inserted(collection, idx, json).await;
                }
            }
            Applied::Updated(idx) => {
                debug!("{} ✏️ 原地更新位置 {}", tag, idx);
                if let Some(json) = snapshot {
                    self.listener.on_record_updated(collection, idx, json).await;
                }
            }
            Applied::Removed(idx) => {
                info!("{} 🗑️ 移除记录 {}（位置 {}）", tag, event_id, idx);
                self.listener.on_record_deleted(collection, event_id).await;
            }
            Applied::Unchanged => {
                debug!("{} 事件未改变列表", tag);
            }
        }

        if let (Some((record_id, user_id)), Some(join)) = (pending_lookup, self.config.join.clone())
        {
            let data = self.data.clone();
            let limit = self.config.request_timeout;
            debug!("{} 🔍 查询作者资料: {}", tag, user_id);
            lookups.spawn(async move {
                let result = lookup_author(data.as_ref(), &join, &user_id, limit).await;
                (record_id, user_id, result)
            });
        }
    }

    async fn finish_lookup(&self, done: std::result::Result<LookupOutcome, tokio::task::JoinError>) {
        let tag = &self.config.log_tag;
        let (record_id, user_id, result) = match done {
            Ok(outcome) => outcome,
            Err(e) => {
                if !e.is_cancelled() {
                    error!("{} 作者查询任务异常: {}", tag, e);
                }
                return;
            }
        };
        let author = match result {
            Ok(Some(author)) => author,
            Ok(None) => {
                debug!("{} 用户 {} 没有资料，作者保持为空", tag, user_id);
                return;
            }
            Err(e) => {
                warn!("{} ⚠️ {}，记录 {} 作者保持为空", tag, e, record_id);
                return;
            }
        };

        let patched = {
            let mut state = self.state();
            if !state.is_current(self.generation) {
                return;
            }
            state.list.patch_author(&record_id, author).and_then(|idx| {
                state
                    .list
                    .records()
                    .get(idx)
                    .and_then(|r| serde_json::to_string(r).ok())
                    .map(|json| (idx, json))
            })
        };
        match patched {
            Some((idx, json)) => {
                debug!("{} 作者资料已补全: {}", tag, record_id);
                self.listener
                    .on_record_updated(&self.config.collection, idx, json)
                    .await;
            }
            None => debug!("{} 记录 {} 已不存在，丢弃作者资料", tag, record_id),
        }
    }

    async fn subscription_lost(&self) {
        let was_live = {
            let mut state = self.state();
            let was_live = state.is_current(self.generation) && state.live;
            if was_live {
                state.live = false;
            }
            was_live
        };
        if was_live {
            warn!(
                "{} 🔌 {} 的推送订阅已断开，列表不再实时更新",
                self.config.log_tag, self.config.collection
            );
            self.listener.on_subscription_lost(&self.config.collection).await;
        }
    }
}

/// 实时列表同步器
///
/// 每个实例独占一个有序列表和一个事件处理任务，实例之间不共享可变状态。
pub struct ListSyncer<E: Entity> {
    config: ListSyncerConfig,
    backend: Backend,
    listener: Arc<dyn SyncListener>,
    state: Arc<StdMutex<SyncState<E>>>,
    session: Mutex<Option<ActiveSession>>,
}

impl<E: Entity> ListSyncer<E> {
    /// 创建同步器（使用默认空监听器）
    pub fn new(backend: Backend, config: ListSyncerConfig) -> Self {
        Self::with_listener(backend, config, Arc::new(EmptySyncListener))
    }

    pub fn with_listener(
        backend: Backend,
        config: ListSyncerConfig,
        listener: Arc<dyn SyncListener>,
    ) -> Self {
        debug!(
            "{} 创建同步器，集合: {}，排序: {:?}",
            config.log_tag, config.collection, config.direction
        );
        Self {
            state: Arc::new(StdMutex::new(SyncState {
                list: OrderedList::new(config.direction),
                live: false,
                generation: 0,
            })),
            config,
            backend,
            listener,
            session: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, SyncState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ListSyncerConfig {
        &self.config
    }

    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    /// 订阅推送并完成首次批量拉取，返回列表条数
    ///
    /// 已初始化时先停止上一轮同步。失败时列表为空、订阅已关闭，不会自动重试。
    pub async fn initialize(&self) -> Result<usize> {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            info!("{} 重新初始化，先停止上一轮同步", self.config.log_tag);
            self.stop(previous).await;
        }

        let tag = &self.config.log_tag;
        let collection = self.config.collection.as_str();
        let limit = self.config.request_timeout;
        info!("{} 🔄 开始同步 {}", tag, collection);
        self.listener.on_sync_start(collection).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = match with_timeout(limit, self.backend.push.subscribe(collection, tx)).await {
            Ok(handle) => handle,
            Err(source) => {
                let err = SyncError::Subscribe {
                    collection: collection.to_string(),
                    source,
                };
                return Err(self.fail_initialize(err).await);
            }
        };

        let query = FetchQuery::new(self.config.direction)
            .with_filter(self.config.filter.clone())
            .with_join(self.config.join.clone());
        let rows = match with_timeout(limit, self.backend.data.fetch_many(collection, &query)).await {
            Ok(rows) => rows,
            Err(source) => {
                if let Err(e) = self.backend.push.unsubscribe(handle).await {
                    warn!("{} 拉取失败后取消订阅也失败: {:#}", tag, e);
                }
                let err = SyncError::Fetch {
                    collection: collection.to_string(),
                    source,
                };
                return Err(self.fail_initialize(err).await);
            }
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<Record<E>>(row) {
                Ok(record) => records.push(record),
                Err(e) => warn!("{} 跳过无法解析的记录: {}", tag, e),
            }
        }

        let (total, generation) = {
            let mut state = self.state();
            state.list.replace_all(records);
            state.live = true;
            state.generation += 1;
            (state.list.len(), state.generation)
        };

        let worker = Worker {
            generation,
            config: self.config.clone(),
            data: self.backend.data.clone(),
            listener: self.listener.clone(),
            state: self.state.clone(),
        };
        let worker = tokio::spawn(worker.run(rx));
        *session = Some(ActiveSession { handle, worker });

        info!("{} ✅ {} 同步完成，共 {} 条", tag, collection, total);
        self.listener.on_sync_finish(collection, total).await;
        Ok(total)
    }

    async fn fail_initialize(&self, err: SyncError) -> SyncError {
        {
            let mut state = self.state();
            state.list.clear();
            state.live = false;
        }
        error!("{} ❌ {}", self.config.log_tag, err);
        self.listener
            .on_sync_failed(&self.config.collection, err.to_string())
            .await;
        err
    }

    /// 停止同步：关闭订阅、停止事件处理、放弃未完成的作者查询
    ///
    /// 可重复调用。
    pub async fn teardown(&self) {
        let mut session = self.session.lock().await;
        match session.take() {
            Some(active) => self.stop(active).await,
            None => debug!("{} 同步器未运行，无需停止", self.config.log_tag),
        }
    }

    async fn stop(&self, active: ActiveSession) {
        {
            let mut state = self.state();
            state.live = false;
            state.generation += 1;
        }
        active.worker.abort();
        // 等任务真正退出，之后不会再有任何列表修改
        let _ = active.worker.await;
        if let Err(e) = with_timeout(
            self.config.request_timeout,
            self.backend.push.unsubscribe(active.handle),
        )
        .await
        {
            warn!("{} 取消订阅失败: {:#}", self.config.log_tag, e);
        }
        info!("{} 🛑 已停止同步 {}", self.config.log_tag, self.config.collection);
    }

    /// 推送订阅是否仍然有效
    pub fn is_live(&self) -> bool {
        self.state().live
    }

    /// 当前列表的快照
    pub fn records(&self) -> Vec<Record<E>> {
        self.state().list.records().to_vec()
    }

    pub fn get(&self, id: &str) -> Option<Record<E>> {
        self.state().list.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().list.is_empty()
    }

    fn require_user(&self) -> Result<CurrentUser> {
        self.backend
            .identity
            .current_user()
            .ok_or(SyncError::NotSignedIn)
    }

    /// 当前用户能否以作者身份修改/删除这条记录（仅客户端判断，服务器另行鉴权）
    ///
    /// 需审核的实体只能由管理员通过审核流程修改，这里始终为 false。
    pub fn can_modify(&self, record: &Record<E>) -> bool {
        match self.backend.identity.current_user() {
            Some(user) => E::POLICY == MutationPolicy::OwnerOnly && record.is_owned_by(&user.id),
            None => false,
        }
    }

    fn check_permission(&self, id: &str, user: &CurrentUser) -> Result<()> {
        if E::POLICY != MutationPolicy::OwnerOnly {
            return Ok(());
        }
        let state = self.state();
        match state.list.get(id) {
            Some(record) if !record.is_owned_by(&user.id) => Err(SyncError::PermissionDenied {
                collection: self.config.collection.clone(),
                id: id.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// 新增记录，创建者列由当前用户填充
    ///
    /// 不会插入本地列表，记录在推送事件到达后才出现。
    pub async fn create_record(&self, payload: &E) -> Result<Record<E>> {
        let user = self.require_user()?;
        let collection = self.config.collection.as_str();
        let mut value = serde_json::to_value(payload)
            .map_err(|e| SyncError::InvalidInput(format!("无法序列化 {}: {}", collection, e)))?;
        let Value::Object(map) = &mut value else {
            return Err(SyncError::InvalidInput(format!("{} 必须序列化为对象", collection)));
        };
        map.insert(E::OWNER_FIELD.to_string(), Value::String(user.id.clone()));

        info!("{} 📤 新增 {} 记录", self.config.log_tag, collection);
        let row = with_timeout(
            self.config.request_timeout,
            self.backend.data.insert_one(collection, value),
        )
        .await
        .map_err(|e| self.mutation_failed(MutationKind::Create, e))?;

        let record: Record<E> = serde_json::from_value(row)
            .map_err(|e| self.mutation_failed(MutationKind::Create, e.into()))?;
        info!(
            "{} ✅ 新增成功 {}，等待推送回显",
            self.config.log_tag, record.id
        );
        Ok(record)
    }

    /// 局部更新记录，本地列表在推送事件到达后才变化
    pub async fn update_record<P>(&self, id: &str, patch: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        let user = self.require_user()?;
        self.check_permission(id, &user)?;
        let collection = self.config.collection.as_str();
        let value = serde_json::to_value(patch)
            .map_err(|e| SyncError::InvalidInput(format!("无法序列化更新内容: {}", e)))?;
        if !value.is_object() {
            return Err(SyncError::InvalidInput("更新内容必须是对象".to_string()));
        }

        info!("{} 📤 更新 {} 记录 {}", self.config.log_tag, collection, id);
        with_timeout(
            self.config.request_timeout,
            self.backend.data.update_one(collection, id, value),
        )
        .await
        .map_err(|e| self.mutation_failed(MutationKind::Update, e))
    }

    /// 删除记录，本地列表在推送事件到达后才移除
    pub async fn delete_record(&self, id: &str) -> Result<()> {
        let user = self.require_user()?;
        self.check_permission(id, &user)?;
        let collection = self.config.collection.as_str();

        info!("{} 📤 删除 {} 记录 {}", self.config.log_tag, collection, id);
        with_timeout(
            self.config.request_timeout,
            self.backend.data.delete_one(collection, id),
        )
        .await
        .map_err(|e| self.mutation_failed(MutationKind::Delete, e))
    }

    fn mutation_failed(&self, op: MutationKind, source: anyhow::Error) -> SyncError {
        let err = SyncError::mutation(&self.config.collection, op, source);
        warn!("{} ⚠️ {}", self.config.log_tag, err);
        err
    }
}

impl<E: Entity> Drop for ListSyncer<E> {
    fn drop(&mut self) {
        let Some(active) = self.session.get_mut().take() else {
            return;
        };
        active.worker.abort();
        let push = self.backend.push.clone();
        let tag = self.config.log_tag.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = push.unsubscribe(active.handle).await {
                    warn!("{} 释放时取消订阅失败: {:#}", tag, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::testing::{
        eventually, init_test_logger, note_row, FakeBackend, Note, RecordingListener,
    };
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn syncer(fake: &Arc<FakeBackend>) -> (ListSyncer<Note>, Arc<RecordingListener>) {
        init_test_logger();
        let listener = RecordingListener::new();
        let config = ListSyncerConfig::for_entity::<Note>()
            .with_request_timeout(Duration::from_secs(1));
        (
            ListSyncer::with_listener(fake.backend(), config, listener.clone()),
            listener,
        )
    }

    fn ids(syncer: &ListSyncer<Note>) -> Vec<String> {
        syncer.records().into_iter().map(|r| r.id).collect()
    }

    #[tokio::test]
    async fn initialize_loads_ordered_snapshot_with_authors() {
        let fake = FakeBackend::new();
        fake.seed_profile("u1", "Ram");
        fake.seed("notes", note_row("b", "2024-05-01T10:05:00Z", "u1", "two"));
        fake.seed("notes", note_row("a", "2024-05-01T10:00:00Z", "u2", "one"));
        let (syncer, listener) = syncer(&fake);

        assert_eq!(syncer.initialize().await.unwrap(), 2);
        assert!(syncer.is_live());
        assert_eq!(ids(&syncer), vec!["a", "b"]);
        assert_eq!(syncer.get("b").unwrap().author_name(), "Ram");
        // u2 没有资料
        assert_eq!(syncer.get("a").unwrap().author_name(), "Unknown User");
        assert_eq!(fake.subscriber_count("notes"), 1);
        assert!(listener.contains("finish:notes:2"));
    }

    #[tokio::test]
    async fn events_during_fetch_apply_on_top_of_snapshot() {
        let fake = FakeBackend::new();
        fake.seed_profile("u3", "Gita");
        fake.seed("notes", note_row("n1", "2024-05-01T10:00:00Z", "u3", "one"));
        fake.seed("notes", note_row("n2", "2024-05-01T10:05:00Z", "u3", "two"));
        fake.set_fetch_delay(Duration::from_millis(150));
        let (syncer, listener) = syncer(&fake);

        // 拉取进行中：已在快照里的记录再次推送插入，另一条被删除
        let pushes = async {
            assert!(eventually(|| async { fake.subscriber_count("notes") == 1 }).await);
            fake.emit(RawChange::insert(
                "notes",
                note_row("n1", "2024-05-01T10:00:00Z", "u3", "one"),
            ));
            fake.emit(RawChange::delete("notes", json!({"id": "n2"})));
        };
        let (total, ()) = tokio::join!(syncer.initialize(), pushes);
        assert_eq!(total.unwrap(), 2);

        assert!(eventually(|| async { ids(&syncer) == vec!["n1"] }).await);
        assert_eq!(syncer.len(), 1);
        assert_eq!(syncer.get("n1").unwrap().author_name(), "Gita");
        assert!(listener.contains("updated:0:n1"));
        assert!(listener.contains("deleted:n2"));
        assert!(!listener.contains("inserted:"));
    }

    #[tokio::test]
    async fn fetch_failure_leaves_list_empty_and_closes_subscription() {
        let fake = FakeBackend::new();
        fake.seed("notes", note_row("a", "2024-05-01T10:00:00Z", "u1", "one"));
        fake.fail_fetch.store(true, Ordering::SeqCst);
        let (syncer, listener) = syncer(&fake);

        let err = syncer.initialize().await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch { .. }));
        assert!(syncer.is_empty());
        assert!(!syncer.is_live());
        assert_eq!(fake.subscriber_count("notes"), 0);
        assert!(listener.contains("failed:notes"));

        // 调用方可以重试
        fake.fail_fetch.store(false, Ordering::SeqCst);
        assert_eq!(syncer.initialize().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn subscribe_failure_is_reported() {
        let fake = FakeBackend::new();
        fake.fail_subscribe.store(true, Ordering::SeqCst);
        let (syncer, _listener) = syncer(&fake);
        let err = syncer.initialize().await.unwrap_err();
        assert!(matches!(err, SyncError::Subscribe { .. }));
        assert!(syncer.is_empty());
    }

    #[tokio::test]
    async fn pushed_insert_lands_in_order_and_delete_removes_only_target() {
        let fake = FakeBackend::new();
        fake.seed_profile("u1", "Ram");
        fake.seed("notes", note_row("a", "2024-05-01T10:00:00Z", "u1", "10:00"));
        fake.seed("notes", note_row("b", "2024-05-01T10:05:00Z", "u1", "10:05"));
        let (syncer, listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        fake.emit(RawChange::insert(
            "notes",
            note_row("c", "2024-05-01T10:03:00Z", "u1", "10:03"),
        ));
        assert!(eventually(|| async { syncer.len() == 3 }).await);
        assert_eq!(ids(&syncer), vec!["a", "c", "b"]);
        assert!(listener.contains("inserted:1:c"));

        fake.emit(RawChange::delete("notes", json!({"id": "a"})));
        assert!(eventually(|| async { syncer.len() == 2 }).await);
        assert_eq!(ids(&syncer), vec!["c", "b"]);
        assert!(listener.contains("deleted:a"));
    }

    #[tokio::test]
    async fn duplicate_insert_and_unknown_delete_are_idempotent() {
        let fake = FakeBackend::new();
        fake.seed("notes", note_row("a", "2024-05-01T10:00:00Z", "u1", "one"));
        fake.seed("notes", note_row("b", "2024-05-01T10:05:00Z", "u1", "two"));
        let (syncer, _listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        fake.emit(RawChange::delete("notes", json!({"id": "missing"})));
        fake.emit(RawChange::insert(
            "notes",
            note_row("a", "2024-05-01T10:00:00Z", "u1", "one (edited)"),
        ));
        assert!(
            eventually(|| async {
                syncer
                    .get("a")
                    .map(|r| r.payload.body == "one (edited)")
                    .unwrap_or(false)
            })
            .await
        );
        assert_eq!(ids(&syncer), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn create_waits_for_push_echo() {
        let fake = FakeBackend::new();
        fake.sign_in("u1");
        let (syncer, _listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        let created = syncer
            .create_record(&Note {
                user_id: String::new(),
                body: "hi".to_string(),
                pinned: false,
            })
            .await
            .unwrap();
        assert_eq!(created.owner_id(), "u1");
        let (_, sent) = fake.inserted.lock().unwrap()[0].clone();
        assert_eq!(sent["user_id"], json!("u1"));

        // 回显到达前列表不变
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(syncer.get(&created.id).is_none());

        let row = fake.row("notes", &created.id).unwrap();
        fake.emit(RawChange::insert("notes", row));
        assert!(eventually(|| async { syncer.get(&created.id).is_some() }).await);
        assert_eq!(syncer.len(), 1);
    }

    #[tokio::test]
    async fn mutations_require_a_signed_in_user() {
        let fake = FakeBackend::new();
        let (syncer, _listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        let note = Note {
            user_id: String::new(),
            body: "hi".to_string(),
            pinned: false,
        };
        assert!(matches!(
            syncer.create_record(&note).await,
            Err(SyncError::NotSignedIn)
        ));
        assert!(matches!(
            syncer.delete_record("x").await,
            Err(SyncError::NotSignedIn)
        ));
        assert!(fake.inserted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_mutations_leave_list_untouched() {
        let fake = FakeBackend::new();
        fake.sign_in("u1");
        fake.seed("notes", note_row("a", "2024-05-01T10:00:00Z", "u1", "mine"));
        let (syncer, _listener) = syncer(&fake);
        syncer.initialize().await.unwrap();
        fake.fail_mutations.store(true, Ordering::SeqCst);

        let err = syncer.delete_record("a").await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Mutation {
                op: MutationKind::Delete,
                ..
            }
        ));
        let err = syncer
            .update_record("a", &json!({"body": "changed"}))
            .await
            .unwrap_err();
        assert!(err.is_mutation());
        assert_eq!(ids(&syncer), vec!["a"]);
        assert_eq!(syncer.get("a").unwrap().payload.body, "mine");
    }

    #[tokio::test]
    async fn owner_only_records_cannot_be_changed_by_others() {
        let fake = FakeBackend::new();
        fake.sign_in("u2");
        fake.seed("notes", note_row("a", "2024-05-01T10:00:00Z", "u1", "theirs"));
        let (syncer, _listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        let record = syncer.get("a").unwrap();
        assert!(!syncer.can_modify(&record));
        assert!(matches!(
            syncer.delete_record("a").await,
            Err(SyncError::PermissionDenied { .. })
        ));
        assert!(matches!(
            syncer.update_record("a", &json!({"pinned": true})).await,
            Err(SyncError::PermissionDenied { .. })
        ));
        assert!(fake.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_and_delete_apply_through_echo() {
        let fake = FakeBackend::new();
        fake.sign_in("u1");
        fake.echo_writes.store(true, Ordering::SeqCst);
        fake.seed("notes", note_row("a", "2024-05-01T10:00:00Z", "u1", "first"));
        fake.seed("notes", note_row("b", "2024-05-01T10:05:00Z", "u1", "second"));
        let (syncer, _listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        syncer
            .update_record("a", &json!({"pinned": true}))
            .await
            .unwrap();
        assert!(eventually(|| async { syncer.get("a").map(|r| r.payload.pinned).unwrap_or(false) }).await);
        assert_eq!(ids(&syncer), vec!["a", "b"]);

        syncer.delete_record("b").await.unwrap();
        assert!(eventually(|| async { syncer.get("b").is_none() }).await);
        assert_eq!(ids(&syncer), vec!["a"]);
    }

    #[tokio::test]
    async fn failed_author_lookup_keeps_record_with_unknown_author() {
        let fake = FakeBackend::new();
        fake.fail_lookups.store(true, Ordering::SeqCst);
        let (syncer, _listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        fake.emit(RawChange::insert(
            "notes",
            note_row("n1", "2024-05-01T10:00:00Z", "u9", "hello"),
        ));
        assert!(eventually(|| async { syncer.get("n1").is_some() }).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = syncer.get("n1").unwrap();
        assert!(record.author.is_none());
        assert_eq!(record.author_name(), "Unknown User");
        assert!(syncer.is_live());

        // 之后的事件照常处理
        fake.emit(RawChange::insert(
            "notes",
            note_row("n2", "2024-05-01T10:01:00Z", "u9", "again"),
        ));
        assert!(eventually(|| async { syncer.len() == 2 }).await);
    }

    #[tokio::test]
    async fn author_lookup_patches_record_in_place() {
        let fake = FakeBackend::new();
        fake.seed_profile("u3", "Gita");
        let (syncer, listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        fake.emit(RawChange::insert(
            "notes",
            note_row("n1", "2024-05-01T10:00:00Z", "u3", "hello"),
        ));
        assert!(
            eventually(|| async {
                syncer
                    .get("n1")
                    .map(|r| r.author_name() == "Gita")
                    .unwrap_or(false)
            })
            .await
        );
        assert!(listener.contains("inserted:0:n1"));
        assert!(listener.contains("updated:0:n1"));
    }

    #[tokio::test]
    async fn lookup_for_deleted_record_is_dropped() {
        let fake = FakeBackend::new();
        fake.seed_profile("u3", "Gita");
        fake.set_lookup_delay(Duration::from_millis(100));
        let (syncer, listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        fake.emit(RawChange::insert(
            "notes",
            note_row("n1", "2024-05-01T10:00:00Z", "u3", "hello"),
        ));
        fake.emit(RawChange::delete("notes", json!({"id": "n1"})));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(syncer.is_empty());
        assert!(!listener.contains("updated"));
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_ignores_late_events() {
        let fake = FakeBackend::new();
        fake.seed("notes", note_row("a", "2024-05-01T10:00:00Z", "u1", "one"));
        let (syncer, _listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        syncer.teardown().await;
        syncer.teardown().await;
        assert!(!syncer.is_live());
        assert_eq!(fake.subscriber_count("notes"), 0);

        fake.emit(RawChange::insert(
            "notes",
            note_row("b", "2024-05-01T10:05:00Z", "u1", "late"),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ids(&syncer), vec!["a"]);
    }

    #[tokio::test]
    async fn teardown_discards_pending_lookups() {
        let fake = FakeBackend::new();
        fake.seed_profile("u3", "Gita");
        fake.set_lookup_delay(Duration::from_millis(100));
        let (syncer, listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        fake.emit(RawChange::insert(
            "notes",
            note_row("n1", "2024-05-01T10:00:00Z", "u3", "hello"),
        ));
        assert!(eventually(|| async { syncer.get("n1").is_some() }).await);
        syncer.teardown().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(syncer.get("n1").unwrap().author.is_none());
        assert!(!listener.contains("updated"));
    }

    #[tokio::test]
    async fn lost_subscription_is_reported_and_reinitialize_recovers() {
        let fake = FakeBackend::new();
        let (syncer, listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        fake.drop_subscriptions();
        assert!(eventually(|| async { !syncer.is_live() }).await);
        assert!(listener.contains("lost:notes"));

        fake.seed("notes", note_row("a", "2024-05-01T10:00:00Z", "u1", "missed"));
        assert_eq!(syncer.initialize().await.unwrap(), 1);
        assert!(syncer.is_live());
        assert_eq!(fake.subscriber_count("notes"), 1);
    }

    #[tokio::test]
    async fn lookups_in_flight_finish_after_subscription_loss() {
        let fake = FakeBackend::new();
        fake.seed_profile("u3", "Gita");
        fake.set_lookup_delay(Duration::from_millis(100));
        let (syncer, listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        fake.emit(RawChange::insert(
            "notes",
            note_row("n1", "2024-05-01T10:00:00Z", "u3", "hello"),
        ));
        assert!(eventually(|| async { syncer.get("n1").is_some() }).await);
        fake.drop_subscriptions();
        assert!(eventually(|| async { listener.contains("lost:notes") }).await);
        assert!(
            eventually(|| async {
                syncer
                    .get("n1")
                    .map(|r| r.author_name() == "Gita")
                    .unwrap_or(false)
            })
            .await
        );
    }

    #[tokio::test]
    async fn reinitialize_replaces_previous_subscription() {
        let fake = FakeBackend::new();
        let (syncer, _listener) = syncer(&fake);
        syncer.initialize().await.unwrap();
        syncer.initialize().await.unwrap();
        assert_eq!(fake.subscriber_count("notes"), 1);
    }

    #[tokio::test]
    async fn filtered_list_drops_rows_that_stop_matching() {
        init_test_logger();
        let fake = FakeBackend::new();
        fake.seed(
            "notes",
            json!({"id": "a", "created_at": "2024-05-01T10:00:00Z", "user_id": "u1", "body": "x", "pinned": true}),
        );
        fake.seed(
            "notes",
            json!({"id": "b", "created_at": "2024-05-01T10:01:00Z", "user_id": "u1", "body": "y", "pinned": false}),
        );
        let config = ListSyncerConfig::for_entity::<Note>()
            .with_filter(Filter::new().eq("pinned", true));
        let syncer: ListSyncer<Note> = ListSyncer::new(fake.backend(), config);
        assert_eq!(syncer.initialize().await.unwrap(), 1);

        // b 变为置顶 → 进入列表；a 取消置顶 → 离开列表
        fake.emit(RawChange::update(
            "notes",
            None,
            json!({"id": "b", "created_at": "2024-05-01T10:01:00Z", "user_id": "u1", "body": "y", "pinned": true}),
        ));
        fake.emit(RawChange::update(
            "notes",
            None,
            json!({"id": "a", "created_at": "2024-05-01T10:00:00Z", "user_id": "u1", "body": "x", "pinned": false}),
        ));
        assert!(eventually(|| async { ids(&syncer) == vec!["b".to_string()] }).await);
    }

    #[tokio::test]
    async fn foreign_and_malformed_events_are_skipped() {
        let fake = FakeBackend::new();
        let (syncer, _listener) = syncer(&fake);
        syncer.initialize().await.unwrap();

        fake.emit_to_all(RawChange::insert(
            "news",
            note_row("x", "2024-05-01T10:00:00Z", "u1", "wrong table"),
        ));
        fake.emit(RawChange::insert("notes", json!({"id": "broken"})));
        fake.emit(RawChange::insert(
            "notes",
            note_row("ok", "2024-05-01T10:00:00Z", "u1", "fine"),
        ));
        assert!(eventually(|| async { syncer.get("ok").is_some() }).await);
        assert_eq!(ids(&syncer), vec!["ok"]);
    }

    #[tokio::test]
    async fn dropping_syncer_releases_subscription() {
        let fake = FakeBackend::new();
        {
            let (syncer, _listener) = syncer(&fake);
            syncer.initialize().await.unwrap();
            assert_eq!(fake.subscriber_count("notes"), 1);
        }
        assert!(eventually(|| async { fake.subscriber_count("notes") == 0 }).await);
    }
}
