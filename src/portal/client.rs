//! 门户客户端
//!
//! 组装后端协作者（托管后端或本地 SQLite），并为各功能模块提供工厂方法。

use crate::portal::auth::{AuthApi, Session, SessionStore, SignUpOutcome};
use crate::portal::backend::local::SqliteBackend;
use crate::portal::backend::realtime::RealtimeClient;
use crate::portal::backend::rest::RestDataAccess;
use crate::portal::backend::{
    Backend, CurrentUser, DataAccess, FetchQuery, Filter, Identity, SortDirection,
};
use crate::portal::chat::{ChatMessage, ChatRoom};
use crate::portal::contacts::{ContactDirectory, EmergencyContact};
use crate::portal::gallery::{Gallery, GalleryItem};
use crate::portal::news::{NewsBoard, NewsItem};
use crate::portal::profile::service::PROFILES_COLLECTION;
use crate::portal::profile::ProfileService;
use crate::portal::sync::error::Result as SyncResult;
use crate::portal::sync::listener::SyncListener;
use crate::portal::sync::models::{Entity, ListSyncerConfig, DEFAULT_REQUEST_TIMEOUT};
use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const ENV_URL: &str = "VILLAGE_PORTAL_URL";
pub const ENV_ANON_KEY: &str = "VILLAGE_PORTAL_ANON_KEY";
pub const ENV_TIMEOUT_SECS: &str = "VILLAGE_PORTAL_TIMEOUT_SECS";

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 托管后端项目地址，例如 `https://xyz.supabase.co`
    pub base_url: String,
    /// 匿名 key（公开）
    pub anon_key: String,
    /// 单次请求超时（拉取、写入、作者查询、实时应答）
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: String, anon_key: String) -> Self {
        Self {
            base_url,
            anon_key,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// 从环境变量读取
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var(ENV_URL).context(format!("缺少环境变量 {}", ENV_URL))?;
        let anon_key =
            std::env::var(ENV_ANON_KEY).context(format!("缺少环境变量 {}", ENV_ANON_KEY))?;
        let mut config = Self::new(base_url, anon_key);
        if let Ok(secs) = std::env::var(ENV_TIMEOUT_SECS) {
            let secs: u64 = secs
                .parse()
                .context(format!("{} 必须是整数秒", ENV_TIMEOUT_SECS))?;
            config.request_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// 门户客户端
pub struct PortalClient {
    backend: Backend,
    sessions: SessionStore,
    request_timeout: Duration,
    // 本地模式下为 None
    auth: Option<AuthApi>,
    realtime: Option<Arc<RealtimeClient>>,
    local: Option<Arc<SqliteBackend>>,
}

impl PortalClient {
    /// 连接托管后端：HTTP 表接口 + 实时推送
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        info!("[Client] 🚀 连接门户后端: {}", config.base_url);
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&config.anon_key).context("anon key 含有非法字符")?,
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .context("创建 HTTP 客户端失败")?;

        let sessions = SessionStore::new();
        let data = Arc::new(RestDataAccess::new(
            http.clone(),
            config.base_url.clone(),
            config.anon_key.clone(),
            sessions.clone(),
        ));
        let realtime = Arc::new(
            RealtimeClient::connect(
                &config.base_url,
                &config.anon_key,
                sessions.clone(),
                config.request_timeout,
            )
            .await?,
        );
        let auth = AuthApi::new(http, &config.base_url, sessions.clone());

        Ok(Self {
            backend: Backend::new(data, realtime.clone(), Arc::new(sessions.clone())),
            sessions,
            request_timeout: config.request_timeout,
            auth: Some(auth),
            realtime: Some(realtime),
            local: None,
        })
    }

    /// 本地模式：SQLite 存储 + 进程内推送，直接以 `user_id` 身份使用
    pub async fn local(db_url: &str, user_id: &str) -> Result<Self> {
        info!("[Client] 💾 本地模式: {}，用户 {}", db_url, user_id);
        let local = Arc::new(SqliteBackend::open(db_url).await?);
        let sessions = SessionStore::new();
        sessions.sign_in_locally(user_id, None);

        // 托管后端在注册时创建资料行，本地模式在这里补上
        let query =
            FetchQuery::new(SortDirection::Ascending).with_filter(Filter::new().eq("id", user_id));
        let existing = local
            .fetch_many(PROFILES_COLLECTION, &query)
            .await
            .context("读取本地资料失败")?;
        if existing.is_empty() {
            local
                .insert_one(
                    PROFILES_COLLECTION,
                    json!({
                        "id": user_id,
                        "full_name": null,
                        "avatar_url": null,
                        "is_admin": false
                    }),
                )
                .await
                .context("创建本地资料失败")?;
        }

        Ok(Self {
            backend: Backend::new(local.clone(), local.clone(), Arc::new(sessions.clone())),
            sessions,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            auth: None,
            realtime: None,
            local: Some(local),
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn current_user(&self) -> Option<CurrentUser> {
        self.sessions.current_user()
    }

    /// 本地模式下的 SQLite 后端
    pub fn local_backend(&self) -> Option<&Arc<SqliteBackend>> {
        self.local.as_ref()
    }

    fn auth(&self) -> Result<&AuthApi> {
        match &self.auth {
            Some(auth) => Ok(auth),
            None => bail!("本地模式不支持账号登录"),
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        self.auth()?.sign_in_with_password(email, password).await
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome> {
        self.auth()?.sign_up(email, password).await
    }

    pub async fn sign_out(&self) -> Result<()> {
        match &self.auth {
            Some(auth) => auth.sign_out().await,
            None => {
                self.sessions.clear();
                Ok(())
            }
        }
    }

    fn config_for<E: Entity>(&self) -> ListSyncerConfig {
        ListSyncerConfig::for_entity::<E>().with_request_timeout(self.request_timeout)
    }

    pub fn chat_room(&self, listener: Arc<dyn SyncListener>) -> ChatRoom {
        ChatRoom::with_config(self.backend.clone(), self.config_for::<ChatMessage>(), listener)
    }

    pub fn gallery(&self, listener: Arc<dyn SyncListener>) -> Gallery {
        Gallery::with_config(self.backend.clone(), self.config_for::<GalleryItem>(), listener)
    }

    /// 当前用户自己的照片
    pub fn my_gallery(&self, listener: Arc<dyn SyncListener>) -> SyncResult<Gallery> {
        Gallery::mine_with_config(self.backend.clone(), self.config_for::<GalleryItem>(), listener)
    }

    pub fn news_board(&self, listener: Arc<dyn SyncListener>) -> NewsBoard {
        NewsBoard::with_config(self.backend.clone(), self.config_for::<NewsItem>(), listener)
    }

    /// 打开紧急联系人名录（会查询管理员身份并完成首次同步）
    pub async fn contact_directory(
        &self,
        listener: Arc<dyn SyncListener>,
    ) -> SyncResult<ContactDirectory> {
        ContactDirectory::open_with_config(
            self.backend.clone(),
            self.config_for::<EmergencyContact>(),
            listener,
        )
        .await
    }

    pub fn profiles(&self) -> ProfileService {
        ProfileService::new(&self.backend).with_timeout(self.request_timeout)
    }

    /// 关闭实时连接；已创建的同步器会收到订阅断开通知
    pub async fn close(&self) {
        if let Some(realtime) = &self.realtime {
            realtime.close().await;
        }
        if let Some(local) = &self.local {
            local.disconnect_all();
        }
    }
}
