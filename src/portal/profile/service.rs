//! 用户资料服务
//!
//! 资料不做实时同步，按需读取。新用户注册后资料行由服务器创建，
//! `full_name` 为空，需要先完成引导（填写名字，可选头像）。

use crate::portal::backend::{
    Backend, CurrentUser, DataAccess, FetchQuery, Filter, Identity, SortDirection,
};
use crate::portal::profile::models::{Profile, ProfilePatch};
use crate::portal::storage::{upload_media, MediaUpload};
use crate::portal::sync::error::{MutationKind, Result, SyncError};
use crate::portal::sync::models::DEFAULT_REQUEST_TIMEOUT;
use crate::portal::sync::service::with_timeout;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const PROFILES_COLLECTION: &str = "profiles";
pub const AVATARS_BUCKET: &str = "avatars";

pub struct ProfileService {
    data: Arc<dyn DataAccess>,
    identity: Arc<dyn Identity>,
    timeout: Duration,
}

impl ProfileService {
    pub fn new(backend: &Backend) -> Self {
        Self {
            data: backend.data.clone(),
            identity: backend.identity.clone(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn require_user(&self) -> Result<CurrentUser> {
        self.identity.current_user().ok_or(SyncError::NotSignedIn)
    }

    /// 读取指定用户的资料，不存在时返回 None
    pub async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let query =
            FetchQuery::new(SortDirection::Ascending).with_filter(Filter::new().eq("id", user_id));
        let lookup_err = |source: anyhow::Error| SyncError::Lookup {
            user_id: user_id.to_string(),
            source,
        };
        let rows = with_timeout(self.timeout, self.data.fetch_many(PROFILES_COLLECTION, &query))
            .await
            .map_err(lookup_err)?;
        rows.into_iter()
            .next()
            .map(|row| serde_json::from_value::<Profile>(row).map_err(|e| lookup_err(e.into())))
            .transpose()
    }

    pub async fn current_profile(&self) -> Result<Option<Profile>> {
        let user = self.require_user()?;
        self.get_profile(&user.id).await
    }

    /// 当前用户是否为管理员（资料缺失按否处理）
    pub async fn is_admin(&self) -> Result<bool> {
        Ok(self
            .current_profile()
            .await?
            .map(|p| p.is_admin)
            .unwrap_or(false))
    }

    /// 还没有填写名字的用户需要先完成引导
    pub async fn needs_onboarding(&self) -> Result<bool> {
        Ok(!self
            .current_profile()
            .await?
            .map(|p| p.has_name())
            .unwrap_or(false))
    }

    /// 更新名字和头像；未提供新头像时保留原头像
    pub async fn update_profile(
        &self,
        full_name: &str,
        avatar: Option<MediaUpload>,
    ) -> Result<Profile> {
        self.save(full_name, avatar, true).await
    }

    /// 新用户引导：名字必填
    pub async fn complete_onboarding(
        &self,
        full_name: &str,
        avatar: Option<MediaUpload>,
    ) -> Result<Profile> {
        if full_name.trim().is_empty() {
            return Err(SyncError::InvalidInput("请填写名字".to_string()));
        }
        let profile = self.save(full_name, avatar, false).await?;
        info!("[Profile] 🎉 {} 完成引导", profile.id);
        Ok(profile)
    }

    async fn save(
        &self,
        full_name: &str,
        avatar: Option<MediaUpload>,
        stamp: bool,
    ) -> Result<Profile> {
        let user = self.require_user()?;
        let existing = self.get_profile(&user.id).await?;

        let avatar_url = match avatar {
            Some(avatar) => Some(
                upload_media(
                    self.data.as_ref(),
                    AVATARS_BUCKET,
                    Some(&user.id),
                    avatar,
                    self.timeout,
                )
                .await?,
            ),
            None => existing.as_ref().and_then(|p| p.avatar_url.clone()),
        };
        let patch = ProfilePatch {
            full_name: full_name.trim().to_string(),
            avatar_url,
            updated_at: stamp.then(Utc::now),
        };
        let value = serde_json::to_value(&patch)
            .map_err(|e| SyncError::InvalidInput(format!("无法序列化资料: {}", e)))?;

        info!("[Profile] ✏️ 更新资料 {}", user.id);
        with_timeout(
            self.timeout,
            self.data.update_one(PROFILES_COLLECTION, &user.id, value),
        )
        .await
        .map_err(|e| {
            let err = SyncError::mutation(PROFILES_COLLECTION, MutationKind::Update, e);
            warn!("[Profile] ⚠️ {}", err);
            err
        })?;

        // 以服务器为准重新读取
        match self.get_profile(&user.id).await? {
            Some(profile) => Ok(profile),
            None => Err(SyncError::mutation(
                PROFILES_COLLECTION,
                MutationKind::Update,
                anyhow::anyhow!("更新后找不到资料 {}", user.id),
            )),
        }
    }
}
