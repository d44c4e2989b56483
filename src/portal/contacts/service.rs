//! 紧急联系人名录
//!
//! 两个同步器：已审核列表所有人可见；待审核列表只对管理员开启。
//! 审核通过时记录的 `is_approved` 变为 true，推送事件到达后自动从
//! 待审核列表移到已审核列表。

use crate::portal::backend::{Backend, Filter};
use crate::portal::contacts::models::{ContactDraft, ContactRecord, EmergencyContact};
use crate::portal::profile::ProfileService;
use crate::portal::storage::{upload_media, MediaUpload};
use crate::portal::sync::error::{Result, SyncError};
use crate::portal::sync::listener::SyncListener;
use crate::portal::sync::models::ListSyncerConfig;
use crate::portal::sync::service::ListSyncer;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub const CONTACT_IMAGES_BUCKET: &str = "contact_images";

pub struct ContactDirectory {
    backend: Backend,
    approved: ListSyncer<EmergencyContact>,
    pending: Option<ListSyncer<EmergencyContact>>,
}

impl ContactDirectory {
    /// 打开名录：加载已审核列表，管理员额外加载待审核列表
    pub async fn open(backend: Backend, listener: Arc<dyn SyncListener>) -> Result<Self> {
        Self::open_with_config(
            backend,
            ListSyncerConfig::for_entity::<EmergencyContact>(),
            listener,
        )
        .await
    }

    /// 以 `config` 为基础打开名录；过滤条件由名录自己设置，
    /// 超时同时用于管理员身份查询
    pub async fn open_with_config(
        backend: Backend,
        config: ListSyncerConfig,
        listener: Arc<dyn SyncListener>,
    ) -> Result<Self> {
        let is_admin = match backend.identity.current_user() {
            Some(_) => ProfileService::new(&backend)
                .with_timeout(config.request_timeout)
                .is_admin()
                .await
                .unwrap_or_else(|e| {
                    warn!("[ContactSync] 查询管理员身份失败，按普通用户处理: {}", e);
                    false
                }),
            None => false,
        };

        let approved = ListSyncer::with_listener(
            backend.clone(),
            config
                .clone()
                .with_filter(Filter::new().eq("is_approved", true)),
            listener.clone(),
        );
        approved.initialize().await?;

        let pending = if is_admin {
            let pending = ListSyncer::with_listener(
                backend.clone(),
                config
                    .with_filter(Filter::new().eq("is_approved", false))
                    .with_log_tag("[PendingContactSync]"),
                listener,
            );
            pending.initialize().await?;
            Some(pending)
        } else {
            None
        };
        info!("[ContactSync] 名录已打开，管理员: {}", is_admin);

        Ok(Self {
            backend,
            approved,
            pending,
        })
    }

    pub fn is_admin(&self) -> bool {
        self.pending.is_some()
    }

    pub fn approved(&self) -> Vec<ContactRecord> {
        self.approved.records()
    }

    /// 待审核的联系人；非管理员始终为空
    pub fn pending(&self) -> Vec<ContactRecord> {
        self.pending
            .as_ref()
            .map(|p| p.records())
            .unwrap_or_default()
    }

    pub fn approved_syncer(&self) -> &ListSyncer<EmergencyContact> {
        &self.approved
    }

    pub fn pending_syncer(&self) -> Option<&ListSyncer<EmergencyContact>> {
        self.pending.as_ref()
    }

    /// 提交联系人，等待管理员审核
    pub async fn submit_contact(
        &self,
        draft: ContactDraft,
        image: Option<MediaUpload>,
    ) -> Result<ContactRecord> {
        let user = self
            .backend
            .identity
            .current_user()
            .ok_or(SyncError::NotSignedIn)?;
        if let Some(field) = draft.missing_field() {
            return Err(SyncError::InvalidInput(format!("{} 不能为空", field)));
        }

        let image_url = match image {
            Some(image) => Some(
                upload_media(
                    self.backend.data.as_ref(),
                    CONTACT_IMAGES_BUCKET,
                    None,
                    image,
                    self.approved.config().request_timeout,
                )
                .await?,
            ),
            None => None,
        };
        info!("[ContactSync] 📇 提交联系人 {}（{}）", draft.name, draft.role);
        self.approved
            .create_record(&EmergencyContact {
                user_id: user.id,
                name: draft.name.trim().to_string(),
                role: draft.role.trim().to_string(),
                phone: draft.phone.trim().to_string(),
                image_url,
                is_approved: false,
            })
            .await
    }

    fn admin_syncer(&self, id: &str) -> Result<&ListSyncer<EmergencyContact>> {
        self.pending.as_ref().ok_or_else(|| SyncError::PermissionDenied {
            collection: self.approved.collection().to_string(),
            id: id.to_string(),
        })
    }

    /// 审核通过（仅管理员）
    pub async fn approve(&self, id: &str) -> Result<()> {
        let pending = self.admin_syncer(id)?;
        info!("[ContactSync] ✅ 审核通过 {}", id);
        pending
            .update_record(id, &json!({ "is_approved": true }))
            .await
    }

    /// 拒绝并删除（仅管理员）
    pub async fn reject(&self, id: &str) -> Result<()> {
        let pending = self.admin_syncer(id)?;
        info!("[ContactSync] ❎ 拒绝 {}", id);
        pending.delete_record(id).await
    }

    pub async fn close(&self) {
        self.approved.teardown().await;
        if let Some(pending) = &self.pending {
            pending.teardown().await;
        }
    }
}
