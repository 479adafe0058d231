//! Per-user session registry with a cluster bridge. Pushes are serialized
//! into a single envelope on the fixed `session:events` topic so any
//! replica can deliver to any connected socket; without a cache client the
//! hub falls back to local-only dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shoal_tenant::CacheHandle;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const SESSION_EVENTS_CHANNEL: &str = "session:events";

const WRITE_DEADLINE: Duration = Duration::from_secs(5);
const CLIENT_CHANNEL_DEPTH: usize = 64;

pub struct SessionClient {
    pub tenant_id: String,
    pub user_id: String,
    pub session_id: String,
    tx: mpsc::Sender<Message>,
}

impl SessionClient {
    pub fn new(
        tenant_id: String,
        user_id: String,
        session_id: String,
        tx: mpsc::Sender<Message>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tenant_id,
            user_id,
            session_id,
            tx,
        })
    }

    pub fn channel() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        mpsc::channel(CLIENT_CHANNEL_DEPTH)
    }

    /// Serializes and writes one frame. The per-client channel orders
    /// writes; the deadline bounds how long a stalled socket can block the
    /// sender.
    pub async fn write_json<T: Serialize>(&self, payload: &T) -> bool {
        let Ok(raw) = serde_json::to_string(payload) else {
            return false;
        };
        matches!(
            tokio::time::timeout(WRITE_DEADLINE, self.tx.send(Message::Text(raw))).await,
            Ok(Ok(()))
        )
    }

    pub async fn close(&self) {
        let _ = self.tx.send(Message::Close(None)).await;
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HubEvent {
    kind: String,
    tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_by: Option<HashMap<String, String>>,
}

fn user_key(tenant_id: &str, user_id: &str) -> String {
    format!("{tenant_id}:{user_id}")
}

struct HubInner {
    clients: RwLock<HashMap<String, HashMap<String, Arc<SessionClient>>>>,
    cache: Option<CacheHandle>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle over the shared registry; store one in AppState.
#[derive(Clone)]
pub struct SessionHub {
    inner: Arc<HubInner>,
}

impl SessionHub {
    pub fn new(cache: Option<CacheHandle>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                clients: RwLock::new(HashMap::new()),
                cache,
                subscriber: Mutex::new(None),
            }),
        }
    }

    /// Starts the cluster subscriber. Idempotent: a hub instance owns at
    /// most one subscription; without a cache client this is a no-op.
    pub fn start(&self) {
        let mut guard = self.inner.subscriber.lock().expect("subscriber lock");
        if guard.is_some() {
            return;
        }
        let Some(cache) = self.inner.cache.clone() else {
            return;
        };
        let hub = self.clone();
        *guard = Some(tokio::spawn(async move { hub.consume(cache).await }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .inner
            .subscriber
            .lock()
            .expect("subscriber lock")
            .take()
        {
            handle.abort();
        }
    }

    pub async fn register(&self, client: Arc<SessionClient>) {
        let key = user_key(&client.tenant_id, &client.user_id);
        let mut clients = self.inner.clients.write().await;
        clients
            .entry(key)
            .or_default()
            .insert(client.session_id.clone(), client.clone());
    }

    /// Removes only the matching session entry; other sessions of the same
    /// user stay registered.
    pub async fn unregister(&self, client: &SessionClient) {
        let key = user_key(&client.tenant_id, &client.user_id);
        {
            let mut clients = self.inner.clients.write().await;
            if let Some(sessions) = clients.get_mut(&key) {
                sessions.remove(&client.session_id);
                if sessions.is_empty() {
                    clients.remove(&key);
                }
            }
        }
        client.close().await;
    }

    pub async fn notify_user(&self, tenant_id: &str, user_id: &str, payload: &Value) {
        let event = HubEvent {
            kind: "notify_user".to_string(),
            tenant_id: tenant_id.to_string(),
            user_id: Some(user_id.to_string()),
            payload: Some(payload.clone()),
            ..Default::default()
        };
        if self.publish_event(&event, 1).await {
            return;
        }
        let fanout_count = self.notify_user_local(tenant_id, user_id, payload).await;
        info!(
            event = "session_hub",
            action = "fallback_dispatch",
            kind = "notify_user",
            tenant_id = %tenant_id,
            fanout_count,
            "local dispatch"
        );
    }

    /// The builder may return a distinct payload per recipient; payloads
    /// are pre-rendered into the envelope so the receiving replica does no
    /// recipient-specific work.
    pub async fn notify_users<F>(&self, tenant_id: &str, user_ids: &[String], builder: F)
    where
        F: Fn(&str) -> Value,
    {
        let unique = shoal_core::dedupe_trimmed(user_ids);
        let mut payload_by = HashMap::with_capacity(unique.len());
        for user_id in &unique {
            payload_by.insert(user_id.clone(), builder(user_id).to_string());
        }
        let event = HubEvent {
            kind: "notify_users".to_string(),
            tenant_id: tenant_id.to_string(),
            user_ids: Some(unique.clone()),
            payload_by: Some(payload_by),
            ..Default::default()
        };
        if self.publish_event(&event, unique.len()).await {
            return;
        }
        let mut total = 0;
        for user_id in &unique {
            total += self
                .notify_user_local(tenant_id, user_id, &builder(user_id))
                .await;
        }
        info!(
            event = "session_hub",
            action = "fallback_dispatch",
            kind = "notify_users",
            tenant_id = %tenant_id,
            fanout_count = total,
            "local dispatch"
        );
    }

    pub async fn broadcast_tenant(&self, tenant_id: &str, payload: &Value) {
        let event = HubEvent {
            kind: "broadcast_tenant".to_string(),
            tenant_id: tenant_id.to_string(),
            payload: Some(payload.clone()),
            ..Default::default()
        };
        let session_count = self.tenant_session_count(tenant_id).await;
        if self.publish_event(&event, session_count).await {
            return;
        }
        let fanout_count = self.broadcast_tenant_local(tenant_id, payload).await;
        info!(
            event = "session_hub",
            action = "fallback_dispatch",
            kind = "broadcast_tenant",
            tenant_id = %tenant_id,
            fanout_count,
            "local dispatch"
        );
    }

    async fn publish_event(&self, event: &HubEvent, fanout_count: usize) -> bool {
        let Some(cache) = &self.inner.cache else {
            return false;
        };
        let Ok(raw) = serde_json::to_string(event) else {
            return false;
        };
        let mut conn = cache.manager();
        let published: Result<(), redis::RedisError> = redis::cmd("PUBLISH")
            .arg(SESSION_EVENTS_CHANNEL)
            .arg(raw)
            .query_async(&mut conn)
            .await;
        match published {
            Ok(()) => {
                counter!("shoal_session_hub_publish_total", 1, "kind" => event.kind.clone());
                info!(
                    event = "session_hub",
                    action = "publish",
                    status = "ok",
                    kind = %event.kind,
                    tenant_id = %event.tenant_id,
                    fanout_count,
                    "published"
                );
                true
            }
            Err(err) => {
                warn!(
                    event = "session_hub",
                    action = "publish",
                    status = "failed",
                    kind = %event.kind,
                    tenant_id = %event.tenant_id,
                    error = %err,
                    "publish failed"
                );
                false
            }
        }
    }

    async fn notify_user_local(&self, tenant_id: &str, user_id: &str, payload: &Value) -> usize {
        let key = user_key(tenant_id, user_id);
        let targets: Vec<Arc<SessionClient>> = {
            let clients = self.inner.clients.read().await;
            clients
                .get(&key)
                .map(|sessions| sessions.values().cloned().collect())
                .unwrap_or_default()
        };
        let mut count = 0;
        for client in targets {
            client.write_json(payload).await;
            count += 1;
        }
        count
    }

    async fn broadcast_tenant_local(&self, tenant_id: &str, payload: &Value) -> usize {
        let prefix = format!("{tenant_id}:");
        let targets: Vec<Arc<SessionClient>> = {
            let clients = self.inner.clients.read().await;
            clients
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .flat_map(|(_, sessions)| sessions.values().cloned())
                .collect()
        };
        let mut count = 0;
        for client in targets {
            client.write_json(payload).await;
            count += 1;
        }
        count
    }

    async fn tenant_session_count(&self, tenant_id: &str) -> usize {
        let prefix = format!("{tenant_id}:");
        let clients = self.inner.clients.read().await;
        clients
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, sessions)| sessions.len())
            .sum()
    }

    async fn consume(&self, cache: CacheHandle) {
        let mut pubsub = match cache.subscriber().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                warn!(error = %err, "session hub subscriber connect failed");
                return;
            }
        };
        if let Err(err) = pubsub.subscribe(SESSION_EVENTS_CHANNEL).await {
            warn!(error = %err, "session hub subscribe failed");
            return;
        }
        debug!(channel = SESSION_EVENTS_CHANNEL, "session hub subscriber started");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let raw: String = match msg.get_payload() {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let Ok(event) = serde_json::from_str::<HubEvent>(&raw) else {
                continue;
            };
            self.dispatch(event).await;
        }
        debug!("session hub subscriber stopped");
    }

    async fn dispatch(&self, event: HubEvent) {
        let mut fanout_count = 0;
        match event.kind.as_str() {
            "notify_user" => {
                let (Some(user_id), Some(payload)) = (&event.user_id, &event.payload) else {
                    return;
                };
                fanout_count = self
                    .notify_user_local(&event.tenant_id, user_id, payload)
                    .await;
            }
            "notify_users" => {
                let (Some(user_ids), Some(payload_by)) = (&event.user_ids, &event.payload_by)
                else {
                    return;
                };
                for user_id in user_ids {
                    let Some(raw) = payload_by.get(user_id) else {
                        continue;
                    };
                    let Ok(payload) = serde_json::from_str::<Value>(raw) else {
                        continue;
                    };
                    fanout_count += self
                        .notify_user_local(&event.tenant_id, user_id, &payload)
                        .await;
                }
            }
            "broadcast_tenant" => {
                let Some(payload) = &event.payload else {
                    return;
                };
                fanout_count = self
                    .broadcast_tenant_local(&event.tenant_id, payload)
                    .await;
            }
            _ => return,
        }
        info!(
            event = "session_hub",
            action = "consume",
            status = "ok",
            kind = %event.kind,
            tenant_id = %event.tenant_id,
            fanout_count,
            "dispatched"
        );
    }

    #[cfg(test)]
    pub(crate) async fn registered_sessions(&self, tenant_id: &str, user_id: &str) -> usize {
        let clients = self.inner.clients.read().await;
        clients
            .get(&user_key(tenant_id, user_id))
            .map(|sessions| sessions.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(
        tenant: &str,
        user: &str,
        session: &str,
    ) -> (Arc<SessionClient>, mpsc::Receiver<Message>) {
        let (tx, rx) = SessionClient::channel();
        (
            SessionClient::new(tenant.into(), user.into(), session.into(), tx),
            rx,
        )
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
    async fn notify_user_reaches_every_session_of_that_user() {
        let hub = SessionHub::new(None);
        let (client_a, mut rx_a) = client("t1", "u1", "s1");
        let (client_b, mut rx_b) = client("t1", "u1", "s2");
        let (_client_c, mut rx_c) = client("t1", "u2", "s3");
        hub.register(client_a).await;
        hub.register(client_b).await;

        hub.notify_user("t1", "u1", &json!({"hello": 1})).await;

        assert_eq!(recv_json(&mut rx_a).await, json!({"hello": 1}));
        assert_eq!(recv_json(&mut rx_b).await, json!({"hello": 1}));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn notify_users_builds_per_recipient_payloads() {
        let hub = SessionHub::new(None);
        let (client_a, mut rx_a) = client("t1", "u1", "s1");
        let (client_b, mut rx_b) = client("t1", "u2", "s2");
        hub.register(client_a).await;
        hub.register(client_b).await;

        hub.notify_users(
            "t1",
            &["u1".to_string(), "u2".to_string(), "u1".to_string()],
            |user_id| json!({"for": user_id}),
        )
        .await;

        assert_eq!(recv_json(&mut rx_a).await, json!({"for": "u1"}));
        assert_eq!(recv_json(&mut rx_b).await, json!({"for": "u2"}));
        // The duplicate recipient id was deduplicated.
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_tenant_stays_inside_the_tenant() {
        let hub = SessionHub::new(None);
        let (client_a, mut rx_a) = client("t1", "u1", "s1");
        let (_client_b, mut rx_b) = client("t2", "u1", "s2");
        hub.register(client_a).await;

        hub.broadcast_tenant("t1", &json!({"type": "status.changed"}))
            .await;

        assert_eq!(
            recv_json(&mut rx_a).await,
            json!({"type": "status.changed"})
        );
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_removes_only_the_matching_session() {
        let hub = SessionHub::new(None);
        let (client_a, _rx_a) = client("t1", "u1", "s1");
        let (client_b, mut rx_b) = client("t1", "u1", "s2");
        hub.register(client_a.clone()).await;
        hub.register(client_b).await;
        assert_eq!(hub.registered_sessions("t1", "u1").await, 2);

        hub.unregister(&client_a).await;
        assert_eq!(hub.registered_sessions("t1", "u1").await, 1);

        hub.notify_user("t1", "u1", &json!({"still": "here"})).await;
        assert_eq!(recv_json(&mut rx_b).await, json!({"still": "here"}));
    }

    #[tokio::test]
    async fn start_without_cache_is_a_no_op() {
        let hub = SessionHub::new(None);
        hub.start();
        hub.start();
        hub.stop();
        hub.stop();
    }

    #[tokio::test]
    #[ignore]
    async fn cluster_bridge_delivers_across_hub_instances() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let cache_a = CacheHandle::connect(&url).await.expect("redis");
        let cache_b = CacheHandle::connect(&url).await.expect("redis");

        let hub_a = SessionHub::new(Some(cache_a));
        let hub_b = SessionHub::new(Some(cache_b));
        hub_a.start();
        hub_b.start();

        let (client, mut rx) = client("t1", "u1", "s1");
        hub_b.register(client).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        hub_a.notify_user("t1", "u1", &json!({"hello": 1})).await;
        assert_eq!(recv_json(&mut rx).await, json!({"hello": 1}));

        hub_a.stop();
        hub_b.stop();
    }
}
