use crate::portal::backend::SortDirection;
use crate::portal::sync::models::{Entity, MutationPolicy, Record};
use serde::{Deserialize, Serialize};

/// 紧急联系人
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub user_id: String,
    pub name: String,
    pub role: String,
    pub phone: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub is_approved: bool,
}

impl Entity for EmergencyContact {
    const COLLECTION: &'static str = "contacts";
    const OWNER_FIELD: &'static str = "user_id";
    const DIRECTION: SortDirection = SortDirection::Descending;
    const LOG_TAG: &'static str = "[ContactSync]";
    const POLICY: MutationPolicy = MutationPolicy::Moderated;

    fn owner_id(&self) -> &str {
        &self.user_id
    }
}

/// 用户提交的联系人信息
#[derive(Debug, Clone, Default)]
pub struct ContactDraft {
    pub name: String,
    pub role: String,
    pub phone: String,
}

impl ContactDraft {
    pub fn new(name: &str, role: &str, phone: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            role: role.trim().to_string(),
            phone: phone.trim().to_string(),
        }
    }

    pub(crate) fn missing_field(&self) -> Option<&'static str> {
        [
            ("name", &self.name),
            ("role", &self.role),
            ("phone", &self.phone),
        ]
        .into_iter()
        .find(|(_, v)| v.trim().is_empty())
        .map(|(field, _)| field)
    }
}

pub type ContactRecord = Record<EmergencyContact>;
