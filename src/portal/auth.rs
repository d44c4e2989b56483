//! 登录会话
//!
//! 只负责调用托管后端的认证接口拿到会话，并把当前用户提供给同步器做
//! 归属判断；认证协议本身由服务器负责。

use crate::portal::backend::{CurrentUser, Identity};
use crate::portal::serialization::decode_jwt_claims;
use crate::portal::types::handle_http_response;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// 认证用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// 登录会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// 过期时间（秒级时间戳）
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

impl Session {
    /// 从已有的 access token 还原会话（例如 CLI 直接传入 token）
    pub fn from_access_token(token: &str) -> Result<Self> {
        let claims = decode_jwt_claims(token)?;
        Ok(Self {
            access_token: token.to_string(),
            refresh_token: None,
            expires_at: claims.exp,
            user: AuthUser {
                id: claims.sub,
                email: claims.email,
            },
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now.timestamp())
    }
}

/// 注册结果：服务器开启邮箱验证时不会直接返回会话
#[derive(Debug, Clone)]
pub enum SignUpOutcome {
    SignedIn(Session),
    ConfirmationRequired(AuthUser),
}

/// 当前会话的共享存储，同时作为同步器的身份接口
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<Option<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session: Session) {
        info!("[Auth] 当前用户: {}", session.user.id);
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn current(&self) -> Option<Session> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 当前 access token；本地模式下为空，返回 None
    pub fn access_token(&self) -> Option<String> {
        self.current()
            .map(|s| s.access_token)
            .filter(|t| !t.is_empty())
    }

    /// 本地模式：不经过认证接口，直接以指定用户身份使用
    pub fn sign_in_locally(&self, user_id: &str, email: Option<String>) {
        self.set(Session {
            access_token: String::new(),
            refresh_token: None,
            expires_at: None,
            user: AuthUser {
                id: user_id.to_string(),
                email,
            },
        });
    }
}

impl Identity for SessionStore {
    fn current_user(&self) -> Option<CurrentUser> {
        self.current().map(|s| CurrentUser {
            id: s.user.id,
            email: s.user.email,
        })
    }
}

/// 认证接口客户端
pub struct AuthApi {
    client: reqwest::Client,
    auth_url: String,
    sessions: SessionStore,
}

impl AuthApi {
    /// `client` 应该已经通过 default_headers 带上 `apikey`
    pub fn new(client: reqwest::Client, base_url: &str, sessions: SessionStore) -> Self {
        Self {
            client,
            auth_url: format!("{}/auth/v1", base_url.trim_end_matches('/')),
            sessions,
        }
    }

    /// 邮箱密码登录，成功后写入会话存储
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let url = format!("{}/token", self.auth_url);
        info!("[Auth] 🔐 正在登录: {}", email);
        debug!("[Auth]   URL: {}", url);

        let response = self
            .client
            .post(&url)
            .query(&[("grant_type", "password")])
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .context("登录请求失败")?;

        let body = handle_http_response(response, "登录").await?;
        let session: Session = serde_json::from_value(body).context("解析登录响应失败")?;
        info!("[Auth] ✅ 登录成功，用户ID: {}", session.user.id);
        self.sessions.set(session.clone());
        Ok(session)
    }

    /// 注册新账号
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome> {
        let url = format!("{}/signup", self.auth_url);
        info!("[Auth] 📝 正在注册: {}", email);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .context("注册请求失败")?;

        let body = handle_http_response(response, "注册").await?;
        if body.get("access_token").and_then(Value::as_str).is_some() {
            let session: Session = serde_json::from_value(body).context("解析注册响应失败")?;
            self.sessions.set(session.clone());
            return Ok(SignUpOutcome::SignedIn(session));
        }

        // 需要邮箱验证：返回的是用户对象（部分版本包在 user 字段里）
        let user_value = body.get("user").cloned().unwrap_or(body);
        let user: AuthUser = serde_json::from_value(user_value).context("解析注册用户失败")?;
        info!("[Auth] 📧 注册成功，等待邮箱验证: {}", user.id);
        Ok(SignUpOutcome::ConfirmationRequired(user))
    }

    /// 退出登录；无论服务器是否成功，本地会话都会被清除
    pub async fn sign_out(&self) -> Result<()> {
        let Some(token) = self.sessions.access_token() else {
            self.sessions.clear();
            return Ok(());
        };
        let url = format!("{}/logout", self.auth_url);
        let result = async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&token)
                .send()
                .await
                .context("退出登录请求失败")?;
            handle_http_response(response, "退出登录").await
        }
        .await;

        self.sessions.clear();
        match result {
            Ok(_) => {
                info!("[Auth] 👋 已退出登录");
                Ok(())
            }
            Err(e) => {
                warn!("[Auth] 服务器退出登录失败（本地会话已清除）: {}", e);
                Err(e)
            }
        }
    }
}
