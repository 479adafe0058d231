//! Session-side domain flows: device-session validation, presence status,
//! notes, and chat notifications. Persistence goes through the dbman
//! surface; realtime pushes go through the hub.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use shoal_core::{
    dedupe_trimmed, ChatNotifyInput, Note, NoteCreateInput, NoteInboxItem, NoteRecipient,
    UserStatus,
};
use shoal_dbman::DbmanError;
use thiserror::Error;

use crate::hub::SessionHub;

const STATUS_VALUES: [&str; 5] = ["online", "offline", "busy", "away", "meeting"];

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] DbmanError),
}

/// The slice of the persistence surface this service needs.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn validate_and_touch_session(
        &self,
        tenant_id: &str,
        user_id: &str,
        session_id: &str,
        session_token: &str,
    ) -> Result<bool, DbmanError>;
    async fn update_session_user_status(&self, status: &UserStatus) -> Result<(), DbmanError>;
    async fn create_session_note(&self, note: &Note) -> Result<Note, DbmanError>;
    async fn list_session_inbox(
        &self,
        tenant_id: &str,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<NoteInboxItem>, DbmanError>;
    async fn mark_session_note_read(
        &self,
        tenant_id: &str,
        user_id: &str,
        note_id: &str,
    ) -> Result<(), DbmanError>;
    async fn save_chat_notifications(
        &self,
        tenant_id: &str,
        sender_user_id: &str,
        input: &ChatNotifyInput,
    ) -> Result<(), DbmanError>;
}

#[async_trait]
impl SessionStore for shoal_dbman::Client {
    async fn validate_and_touch_session(
        &self,
        tenant_id: &str,
        user_id: &str,
        session_id: &str,
        session_token: &str,
    ) -> Result<bool, DbmanError> {
        shoal_dbman::Client::validate_and_touch_session(
            self,
            tenant_id,
            user_id,
            session_id,
            session_token,
        )
        .await
    }

    async fn update_session_user_status(&self, status: &UserStatus) -> Result<(), DbmanError> {
        shoal_dbman::Client::update_session_user_status(self, status).await
    }

    async fn create_session_note(&self, note: &Note) -> Result<Note, DbmanError> {
        shoal_dbman::Client::create_session_note(self, note).await
    }

    async fn list_session_inbox(
        &self,
        tenant_id: &str,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<NoteInboxItem>, DbmanError> {
        shoal_dbman::Client::list_session_inbox(self, tenant_id, user_id, limit).await
    }

    async fn mark_session_note_read(
        &self,
        tenant_id: &str,
        user_id: &str,
        note_id: &str,
    ) -> Result<(), DbmanError> {
        shoal_dbman::Client::mark_session_note_read(self, tenant_id, user_id, note_id).await
    }

    async fn save_chat_notifications(
        &self,
        tenant_id: &str,
        sender_user_id: &str,
        input: &ChatNotifyInput,
    ) -> Result<(), DbmanError> {
        shoal_dbman::Client::save_chat_notifications(self, tenant_id, sender_user_id, input).await
    }
}

pub struct SessionService {
    store: Arc<dyn SessionStore>,
    hub: SessionHub,
}

impl SessionService {
    pub fn new(store: Arc<dyn SessionStore>, hub: SessionHub) -> Arc<Self> {
        Arc::new(Self { store, hub })
    }

    /// Blank identifiers short-circuit to invalid without a store call.
    pub async fn validate_session(
        &self,
        tenant_id: &str,
        user_id: &str,
        session_id: &str,
        session_token: &str,
    ) -> Result<bool, ServiceError> {
        if tenant_id.trim().is_empty()
            || user_id.trim().is_empty()
            || session_id.trim().is_empty()
            || session_token.trim().is_empty()
        {
            return Ok(false);
        }
        Ok(self
            .store
            .validate_and_touch_session(tenant_id, user_id, session_id, session_token)
            .await?)
    }

    pub async fn update_status(
        &self,
        tenant_id: &str,
        user_id: &str,
        status: &str,
        status_note: &str,
    ) -> Result<(), ServiceError> {
        let status = status.trim().to_ascii_lowercase();
        if status.is_empty() {
            return Err(ServiceError::Validation("status is required".to_string()));
        }
        if !STATUS_VALUES.contains(&status.as_str()) {
            return Err(ServiceError::Validation(
                "status must be one of online|offline|busy|away|meeting".to_string(),
            ));
        }

        let item = UserStatus {
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            status,
            status_note: status_note.trim().to_string(),
            updated_at: Utc::now(),
        };
        self.store.update_session_user_status(&item).await?;

        self.hub
            .broadcast_tenant(
                tenant_id,
                &json!({
                    "type": "status.changed",
                    "tenant_id": item.tenant_id,
                    "user_id": item.user_id,
                    "status": item.status,
                    "status_note": item.status_note,
                    "updated_at": item.updated_at,
                }),
            )
            .await;
        Ok(())
    }

    pub async fn send_note(
        &self,
        tenant_id: &str,
        sender_user_id: &str,
        input: NoteCreateInput,
    ) -> Result<Note, ServiceError> {
        if input.title.trim().is_empty() {
            return Err(ServiceError::Validation("title is required".to_string()));
        }
        if input.to.len() + input.cc.len() + input.bcc.len() == 0 {
            return Err(ServiceError::Validation(
                "at least one recipient is required".to_string(),
            ));
        }

        let mut recipients = Vec::new();
        for (user_ids, recipient_type) in [
            (&input.to, "to"),
            (&input.cc, "cc"),
            (&input.bcc, "bcc"),
        ] {
            for user_id in dedupe_trimmed(user_ids) {
                recipients.push(NoteRecipient {
                    user_id,
                    recipient_type: recipient_type.to_string(),
                });
            }
        }

        let note = self
            .store
            .create_session_note(&Note {
                tenant_id: tenant_id.to_string(),
                sender_user_id: sender_user_id.to_string(),
                title: input.title.trim().to_string(),
                body: input.body.clone(),
                recipients,
                files: input.files.clone(),
                ..Default::default()
            })
            .await?;

        // First recipient type wins when a user appears in several lists.
        let mut recipient_type_by_user: HashMap<String, String> = HashMap::new();
        for recipient in &note.recipients {
            recipient_type_by_user
                .entry(recipient.user_id.clone())
                .or_insert_with(|| recipient.recipient_type.clone());
        }
        let user_ids: Vec<String> = recipient_type_by_user.keys().cloned().collect();

        let tenant = tenant_id.to_string();
        let sender = sender_user_id.to_string();
        self.hub
            .notify_users(tenant_id, &user_ids, |user_id| {
                json!({
                    "type": "note.received",
                    "note_id": note.note_id,
                    "tenant_id": tenant,
                    "sender_user_id": sender,
                    "recipient_type": recipient_type_by_user.get(user_id),
                    "title": note.title,
                    "body": note.body,
                    "files": note.files,
                    "created_at": note.created_at,
                })
            })
            .await;

        Ok(note)
    }

    pub async fn notify_chat(
        &self,
        tenant_id: &str,
        sender_user_id: &str,
        auth_token: &str,
        input: ChatNotifyInput,
    ) -> Result<(), ServiceError> {
        if input.room_id.trim().is_empty() {
            return Err(ServiceError::Validation("room_id is required".to_string()));
        }
        let recipients = dedupe_trimmed(&input.recipient_ids);
        if recipients.is_empty() {
            return Err(ServiceError::Validation(
                "recipient_ids is required".to_string(),
            ));
        }
        self.store
            .save_chat_notifications(tenant_id, sender_user_id, &input)
            .await?;

        let tenant = tenant_id.to_string();
        let sender = sender_user_id.to_string();
        let token = auth_token.trim().to_string();
        self.hub
            .notify_users(tenant_id, &recipients, |user_id| {
                json!({
                    "type": "chat.notification",
                    "tenant_id": tenant,
                    "room_id": input.room_id,
                    "message_id": input.message_id,
                    "auth_token": token,
                    "sender_user_id": sender,
                    "recipient_user_id": user_id,
                    "title": input.title,
                    "body": input.body,
                    "created_at": Utc::now(),
                })
            })
            .await;
        Ok(())
    }

    pub async fn list_inbox(
        &self,
        tenant_id: &str,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<NoteInboxItem>, ServiceError> {
        let limit = if limit <= 0 || limit > 200 { 50 } else { limit };
        Ok(self
            .store
            .list_session_inbox(tenant_id, user_id, limit)
            .await?)
    }

    pub async fn mark_note_read(
        &self,
        tenant_id: &str,
        user_id: &str,
        note_id: &str,
    ) -> Result<(), ServiceError> {
        if note_id.trim().is_empty() {
            return Err(ServiceError::Validation("note_id is required".to_string()));
        }
        Ok(self
            .store
            .mark_session_note_read(tenant_id, user_id, note_id)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::SessionClient;
    use axum::extract::ws::Message;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct StubStore {
        statuses: Mutex<Vec<UserStatus>>,
        notes: Mutex<Vec<Note>>,
        notifications: Mutex<Vec<ChatNotifyInput>>,
        valid_session: bool,
    }

    #[async_trait]
    impl SessionStore for StubStore {
        async fn validate_and_touch_session(
            &self,
            _tenant_id: &str,
            _user_id: &str,
            _session_id: &str,
            _session_token: &str,
        ) -> Result<bool, DbmanError> {
            Ok(self.valid_session)
        }

        async fn update_session_user_status(
            &self,
            status: &UserStatus,
        ) -> Result<(), DbmanError> {
            self.statuses.lock().unwrap().push(status.clone());
            Ok(())
        }

        async fn create_session_note(&self, note: &Note) -> Result<Note, DbmanError> {
            let mut created = note.clone();
            created.note_id = "n1".to_string();
            created.created_at = Some(Utc::now());
            self.notes.lock().unwrap().push(created.clone());
            Ok(created)
        }

        async fn list_session_inbox(
            &self,
            _tenant_id: &str,
            _user_id: &str,
            _limit: i64,
        ) -> Result<Vec<NoteInboxItem>, DbmanError> {
            Ok(Vec::new())
        }

        async fn mark_session_note_read(
            &self,
            _tenant_id: &str,
            _user_id: &str,
            _note_id: &str,
        ) -> Result<(), DbmanError> {
            Ok(())
        }

        async fn save_chat_notifications(
            &self,
            _tenant_id: &str,
            _sender_user_id: &str,
            input: &ChatNotifyInput,
        ) -> Result<(), DbmanError> {
            self.notifications.lock().unwrap().push(input.clone());
            Ok(())
        }
    }

    async fn registered_client(
        hub: &SessionHub,
        tenant: &str,
        user: &str,
        session: &str,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = SessionClient::channel();
        let client = SessionClient::new(tenant.into(), user.into(), session.into(), tx);
        hub.register(client).await;
        rx
    }

    async fn recv_json(rx: &mut mpsc::Receiver<Message>) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame in time")
            .expect("open channel");
        match frame {
            Message::Text(text) => serde_json::from_str(&text).expect("json frame"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn blank_session_fields_are_invalid_without_a_store_call() {
        let service = SessionService::new(
            Arc::new(StubStore {
                valid_session: true,
                ..Default::default()
            }),
            SessionHub::new(None),
        );
        assert!(!service.validate_session("", "u1", "s1", "tok").await.unwrap());
        assert!(!service.validate_session("t1", "u1", "s1", " ").await.unwrap());
        assert!(service
            .validate_session("t1", "u1", "s1", "tok")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn update_status_validates_and_broadcasts() {
        let store = Arc::new(StubStore::default());
        let hub = SessionHub::new(None);
        let mut rx = registered_client(&hub, "t1", "u2", "s1").await;
        let service = SessionService::new(store.clone(), hub.clone());

        let err = service
            .update_status("t1", "u1", "sleeping", "")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        service
            .update_status("t1", "u1", " Busy ", " heads down ")
            .await
            .unwrap();
        assert_eq!(store.statuses.lock().unwrap()[0].status, "busy");

        let frame = recv_json(&mut rx).await;
        assert_eq!(frame["type"], "status.changed");
        assert_eq!(frame["status"], "busy");
        assert_eq!(frame["status_note"], "heads down");
    }

    #[tokio::test]
    async fn send_note_notifies_each_recipient_with_their_type() {
        let store = Arc::new(StubStore::default());
        let hub = SessionHub::new(None);
        let mut rx_to = registered_client(&hub, "t1", "u-to", "s1").await;
        let mut rx_cc = registered_client(&hub, "t1", "u-cc", "s2").await;
        let service = SessionService::new(store, hub.clone());

        let note = service
            .send_note(
                "t1",
                "u-sender",
                NoteCreateInput {
                    title: "standup".into(),
                    body: "notes".into(),
                    to: vec!["u-to".into()],
                    cc: vec!["u-cc".into(), "u-to".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(note.note_id, "n1");

        let frame = recv_json(&mut rx_to).await;
        assert_eq!(frame["type"], "note.received");
        assert_eq!(frame["recipient_type"], "to");
        let frame = recv_json(&mut rx_cc).await;
        assert_eq!(frame["recipient_type"], "cc");
        // u-to appeared in both lists but is notified once.
        assert!(rx_to.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_note_requires_title_and_recipients() {
        let service = SessionService::new(Arc::new(StubStore::default()), SessionHub::new(None));
        assert!(matches!(
            service
                .send_note("t1", "u1", NoteCreateInput::default())
                .await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            service
                .send_note(
                    "t1",
                    "u1",
                    NoteCreateInput {
                        title: "hi".into(),
                        ..Default::default()
                    },
                )
                .await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn notify_chat_persists_then_notifies_recipients() {
        let store = Arc::new(StubStore::default());
        let hub = SessionHub::new(None);
        let mut rx = registered_client(&hub, "t1", "u2", "s1").await;
        let service = SessionService::new(store.clone(), hub.clone());

        service
            .notify_chat(
                "t1",
                "u1",
                "tok-123",
                ChatNotifyInput {
                    room_id: "r1".into(),
                    message_id: "m1".into(),
                    title: "mention".into(),
                    body: "hi".into(),
                    recipient_ids: vec!["u2".into()],
                },
            )
            .await
            .unwrap();

        assert_eq!(store.notifications.lock().unwrap().len(), 1);
        let frame = recv_json(&mut rx).await;
        assert_eq!(frame["type"], "chat.notification");
        assert_eq!(frame["recipient_user_id"], "u2");
        assert_eq!(frame["auth_token"], "tok-123");
    }
}
