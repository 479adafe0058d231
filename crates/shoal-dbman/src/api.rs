//! Typed calls over the internal dbman surface, plus the tenant metadata
//! provider the routing layer consumes.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use shoal_core::{
    ChatNotifyInput, Message, MetaError, Note, NoteInboxItem, Tenant, TenantMeta,
    TenantMetaProvider, UserStatus,
};

use crate::client::{Client, DbmanError, BASE_PATH};

#[derive(Deserialize)]
struct OkResponse {
    #[serde(default)]
    #[allow(dead_code)]
    ok: bool,
}

#[derive(Deserialize)]
struct CheckResponse {
    #[serde(default)]
    ok: bool,
}

#[derive(Deserialize)]
struct ValidateResponse {
    #[serde(default)]
    valid: bool,
}

impl Client {
    pub async fn create_message(&self, msg: &Message) -> Result<Message, DbmanError> {
        self.post(&format!("{BASE_PATH}/messages"), msg).await
    }

    pub async fn is_room_member(
        &self,
        tenant_id: &str,
        room_id: &str,
        user_id: &str,
    ) -> Result<bool, DbmanError> {
        let payload = json!({"tenant_id": tenant_id, "room_id": room_id, "user_id": user_id});
        let resp: CheckResponse = self
            .post(&format!("{BASE_PATH}/rooms/members/check"), &payload)
            .await?;
        Ok(resp.ok)
    }

    pub async fn mark_read_up_to(
        &self,
        tenant_id: &str,
        room_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<(), DbmanError> {
        let payload = json!({
            "tenant_id": tenant_id,
            "room_id": room_id,
            "user_id": user_id,
            "message_id": message_id,
        });
        let _: OkResponse = self
            .post(&format!("{BASE_PATH}/messages/read"), &payload)
            .await?;
        Ok(())
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Tenant, DbmanError> {
        let payload = json!({"tenant_id": tenant_id});
        self.post(&format!("{BASE_PATH}/tenants/get"), &payload)
            .await
    }

    pub async fn validate_and_touch_session(
        &self,
        tenant_id: &str,
        user_id: &str,
        session_id: &str,
        session_token: &str,
    ) -> Result<bool, DbmanError> {
        let payload = json!({
            "tenant_id": tenant_id,
            "user_id": user_id,
            "session_id": session_id,
            "session_token": session_token,
        });
        let resp: ValidateResponse = self
            .post(&format!("{BASE_PATH}/session/device/validate"), &payload)
            .await?;
        Ok(resp.valid)
    }

    pub async fn update_session_user_status(&self, status: &UserStatus) -> Result<(), DbmanError> {
        let _: serde_json::Value = self
            .post(&format!("{BASE_PATH}/session/status/update"), status)
            .await?;
        Ok(())
    }

    pub async fn create_session_note(&self, note: &Note) -> Result<Note, DbmanError> {
        self.post(&format!("{BASE_PATH}/session/notes/create"), note)
            .await
    }

    pub async fn list_session_inbox(
        &self,
        tenant_id: &str,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<NoteInboxItem>, DbmanError> {
        let payload = json!({"tenant_id": tenant_id, "user_id": user_id, "limit": limit});
        self.post(&format!("{BASE_PATH}/session/notes/inbox"), &payload)
            .await
    }

    pub async fn mark_session_note_read(
        &self,
        tenant_id: &str,
        user_id: &str,
        note_id: &str,
    ) -> Result<(), DbmanError> {
        let payload = json!({"tenant_id": tenant_id, "user_id": user_id, "note_id": note_id});
        let _: serde_json::Value = self
            .post(&format!("{BASE_PATH}/session/notes/read"), &payload)
            .await?;
        Ok(())
    }

    pub async fn save_chat_notifications(
        &self,
        tenant_id: &str,
        sender_user_id: &str,
        input: &ChatNotifyInput,
    ) -> Result<(), DbmanError> {
        let payload = json!({
            "tenant_id": tenant_id,
            "sender_user_id": sender_user_id,
            "input": {
                "room_id": input.room_id,
                "message_id": input.message_id,
                "title": input.title,
                "body": input.body,
                "recipient_ids": input.recipient_ids,
            },
        });
        let _: serde_json::Value = self
            .post(&format!("{BASE_PATH}/session/chat/notify"), &payload)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TenantMetaProvider for Client {
    async fn tenant_meta(&self, tenant_id: &str) -> Result<TenantMeta, MetaError> {
        match self.get_tenant(tenant_id).await {
            Ok(tenant) => Ok(TenantMeta::from_tenant(&tenant)),
            Err(err) if err.status() == Some(404) => Err(MetaError::NotFound),
            Err(err) => Err(MetaError::Upstream(err.to_string())),
        }
    }
}
