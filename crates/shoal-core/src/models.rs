use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Full tenant descriptor as stored by the persistence tier. Read-mostly;
/// routing decisions only look at the `TenantMeta` projection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub deployment_mode: String,
    #[serde(default)]
    pub dedicated_dsn: String,
    #[serde(default)]
    pub dedicated_redis_addr: String,
    #[serde(default)]
    pub dedicated_broker_url: String,
    #[serde(default)]
    pub dedicated_object_endpoint: String,
    #[serde(default)]
    pub dedicated_object_access_key: String,
    #[serde(default)]
    pub dedicated_object_secret_key: String,
    #[serde(default)]
    pub dedicated_object_bucket: String,
    #[serde(default)]
    pub dedicated_object_use_ssl: bool,
    #[serde(default)]
    pub user_count_threshold: i64,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Routing projection of a tenant descriptor. Mode is lowercased and every
/// URL trimmed so routers can compare without re-normalizing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TenantMeta {
    pub deployment_mode: String,
    pub dedicated_dsn: String,
    pub dedicated_redis_addr: String,
    pub dedicated_broker_url: String,
    pub dedicated_object_endpoint: String,
    pub dedicated_object_access_key: String,
    pub dedicated_object_secret_key: String,
    pub dedicated_object_bucket: String,
    pub dedicated_object_use_ssl: bool,
    pub is_active: bool,
}

pub const DEPLOYMENT_MODE_DEDICATED: &str = "dedicated";

impl TenantMeta {
    pub fn from_tenant(tenant: &Tenant) -> Self {
        Self {
            deployment_mode: tenant.deployment_mode.trim().to_ascii_lowercase(),
            dedicated_dsn: tenant.dedicated_dsn.trim().to_string(),
            dedicated_redis_addr: tenant.dedicated_redis_addr.trim().to_string(),
            dedicated_broker_url: tenant.dedicated_broker_url.trim().to_string(),
            dedicated_object_endpoint: tenant.dedicated_object_endpoint.trim().to_string(),
            dedicated_object_access_key: tenant.dedicated_object_access_key.trim().to_string(),
            dedicated_object_secret_key: tenant.dedicated_object_secret_key.trim().to_string(),
            dedicated_object_bucket: tenant.dedicated_object_bucket.trim().to_string(),
            dedicated_object_use_ssl: tenant.dedicated_object_use_ssl,
            is_active: tenant.is_active,
        }
    }

    pub fn is_dedicated(&self) -> bool {
        self.deployment_mode == DEPLOYMENT_MODE_DEDICATED
    }
}

/// A persisted chat message. `id` is assigned by the persistence tier and is
/// monotonically increasing per room within a tenant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub tenant_id: String,
    #[serde(default)]
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub body: String,
    #[serde(default)]
    pub meta_json: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStatus {
    pub tenant_id: String,
    pub user_id: String,
    pub status: String,
    #[serde(default)]
    pub status_note: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteFile {
    pub file_name: String,
    pub object_key: String,
    pub content_type: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoteCreateInput {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub files: Vec<NoteFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteRecipient {
    pub user_id: String,
    #[serde(rename = "type")]
    pub recipient_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Note {
    #[serde(default)]
    pub note_id: String,
    pub tenant_id: String,
    pub sender_user_id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub recipients: Vec<NoteRecipient>,
    #[serde(default)]
    pub files: Vec<NoteFile>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteInboxItem {
    pub note_id: String,
    pub sender_user_id: String,
    pub recipient_type: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub file_count: i64,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatNotifyInput {
    pub room_id: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub recipient_ids: Vec<String>,
}

/// Trims, drops empties, and de-duplicates while preserving order.
pub fn dedupe_trimmed(items: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let value = item.trim();
        if value.is_empty() || !seen.insert(value.to_string()) {
            continue;
        }
        out.push(value.to_string());
    }
    out
}
