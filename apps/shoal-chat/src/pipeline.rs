//! The message pipeline: persist through dbman, then run the best-effort
//! side effects (broker event, vector index, sender read-mark). Side-effect
//! failures are logged and swallowed; only the authoritative write can fail
//! the call.

use std::sync::Arc;

use metrics::counter;
use serde_json::json;
use shoal_core::Message;
use shoal_dbman::{Client, DbmanError};
use shoal_tenant::BrokerRouter;
use tracing::warn;

use crate::vector::VectorClient;

pub struct ChatService {
    dbman: Arc<Client>,
    broker: Option<Arc<BrokerRouter>>,
    vector: VectorClient,
}

impl ChatService {
    pub fn new(
        dbman: Arc<Client>,
        broker: Option<Arc<BrokerRouter>>,
        vector: VectorClient,
    ) -> Arc<Self> {
        Arc::new(Self {
            dbman,
            broker,
            vector,
        })
    }

    pub async fn is_room_member(
        &self,
        tenant_id: &str,
        room_id: &str,
        user_id: &str,
    ) -> Result<bool, DbmanError> {
        self.dbman.is_room_member(tenant_id, room_id, user_id).await
    }

    pub async fn mark_read_up_to(
        &self,
        tenant_id: &str,
        room_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<(), DbmanError> {
        self.dbman
            .mark_read_up_to(tenant_id, room_id, user_id, message_id)
            .await
    }

    pub async fn create_message(&self, mut msg: Message) -> Result<Message, DbmanError> {
        if msg.meta_json.trim().is_empty() {
            msg.meta_json = "{}".to_string();
        }
        let tenant_id = msg.tenant_id.clone();
        let created = self.dbman.create_message(&msg).await?;
        counter!("shoal_chat_messages_persisted_total", 1);

        // Best effort from here: the write is already authoritative. The
        // sender read-mark runs last so the ordering matches what clients
        // expect after a crash (read-marks are idempotent and re-issued).
        if let Some(broker) = &self.broker {
            let event = json!({
                "event": "message.created",
                "message_id": created.id,
                "room_id": created.room_id,
                "sender_id": created.sender_id,
                "body": created.body,
                "created_at": created.created_at,
            });
            if let Err(err) = broker.publish(&tenant_id, "message.created", &event).await {
                counter!("shoal_chat_side_effect_failures_total", 1, "effect" => "broker");
                warn!(tenant_id = %tenant_id, room_id = %created.room_id, error = %err, "broker publish failed");
            }
        }

        if let Err(err) = self
            .vector
            .index_message(&created.id, &created.room_id, &created.body)
            .await
        {
            counter!("shoal_chat_side_effect_failures_total", 1, "effect" => "vector");
            warn!(message_id = %created.id, error = %err, "vector index failed");
        }

        if let Err(err) = self
            .dbman
            .mark_read_up_to(&tenant_id, &created.room_id, &created.sender_id, &created.id)
            .await
        {
            counter!("shoal_chat_side_effect_failures_total", 1, "effect" => "read_mark");
            warn!(message_id = %created.id, error = %err, "sender read-mark failed");
        }

        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use shoal_dbman::ClientSettings;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail_persist: Arc<AtomicBool>,
    }

    async fn create_message_stub(
        State(rec): State<Recorder>,
        Json(msg): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        rec.calls.lock().unwrap().push("persist");
        if rec.fail_persist.load(Ordering::SeqCst) {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "boom"})),
            );
        }
        let mut out = msg;
        out["id"] = json!("m-1");
        out["created_at"] = json!("2026-08-02T10:00:00Z");
        (StatusCode::OK, Json(out))
    }

    async fn mark_read_stub(State(rec): State<Recorder>, Json(_): Json<Value>) -> Json<Value> {
        rec.calls.lock().unwrap().push("read_mark");
        Json(json!({"ok": true}))
    }

    async fn vector_index_stub(State(rec): State<Recorder>, Json(_): Json<Value>) -> Json<Value> {
        rec.calls.lock().unwrap().push("vector");
        Json(json!({"ok": true}))
    }

    async fn spawn_stub() -> (String, Recorder) {
        let rec = Recorder::default();
        let app = Router::new()
            .route("/api/internal/v1/db/messages", post(create_message_stub))
            .route("/api/internal/v1/db/messages/read", post(mark_read_stub))
            .route("/api/v1/vectors/messages/index", post(vector_index_stub))
            .with_state(rec.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("stub server");
        });
        (format!("http://{addr}"), rec)
    }

    fn service(url: &str) -> Arc<ChatService> {
        let dbman = Arc::new(Client::with_settings(
            [url],
            ClientSettings {
                http_timeout: Duration::from_millis(500),
                fail_threshold: 3,
                cooldown: Duration::from_secs(10),
            },
        ));
        ChatService::new(dbman, None, VectorClient::new(url, true))
    }

    fn inbound() -> Message {
        Message {
            tenant_id: "t1".into(),
            room_id: "r1".into(),
            sender_id: "u1".into(),
            body: "hi".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_message_persists_then_runs_side_effects_in_order() {
        let (url, rec) = spawn_stub().await;
        let service = service(&url);

        let created = service.create_message(inbound()).await.expect("create");
        assert_eq!(created.id, "m-1");
        assert_eq!(created.body, "hi");
        // Empty meta defaults to an empty object before persisting.
        assert_eq!(created.meta_json, "{}");
        assert_eq!(
            *rec.calls.lock().unwrap(),
            vec!["persist", "vector", "read_mark"]
        );
    }

    #[tokio::test]
    async fn persist_failure_returns_without_side_effects() {
        let (url, rec) = spawn_stub().await;
        rec.fail_persist.store(true, Ordering::SeqCst);
        let service = service(&url);

        let err = service.create_message(inbound()).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(*rec.calls.lock().unwrap(), vec!["persist"]);
    }
}

