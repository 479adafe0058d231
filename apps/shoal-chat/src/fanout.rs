//! Per-replica room fan-out. Each active room key owns one subscriber task
//! listening on the tenant's cache pub/sub channel; received payloads are
//! written to every local socket in the room.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::StreamExt;
use metrics::counter;
use shoal_tenant::CacheHandle;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Deadline for a single socket write. A slow socket backs up the other
/// sockets in its room for at most this long.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(5);

const SOCKET_CHANNEL_DEPTH: usize = 64;

/// One connected chat socket. Frames are handed to a per-connection
/// forwarder task through a bounded channel, which serializes writes.
pub struct RoomSocket {
    id: Uuid,
    tx: mpsc::Sender<Message>,
}

impl RoomSocket {
    pub fn new(tx: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            tx,
        })
    }

    pub fn channel() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        mpsc::channel(SOCKET_CHANNEL_DEPTH)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn send_text(&self, text: String) -> bool {
        matches!(
            tokio::time::timeout(WRITE_DEADLINE, self.tx.send(Message::Text(text))).await,
            Ok(Ok(()))
        )
    }

    pub async fn close(&self) {
        let _ = self.tx.send(Message::Close(None)).await;
    }
}

struct RoomState {
    sockets: HashMap<Uuid, Arc<RoomSocket>>,
    subscriber: JoinHandle<()>,
}

struct FanoutInner {
    rooms: RwLock<HashMap<String, RoomState>>,
}

/// Cloneable handle over the shared room map; store one in AppState.
#[derive(Clone)]
pub struct RoomFanout {
    inner: Arc<FanoutInner>,
}

impl RoomFanout {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FanoutInner {
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Adds a socket to the room, starting the room's subscriber task if
    /// this is the first socket on this replica.
    pub async fn join(
        &self,
        room_key: &str,
        channel: &str,
        cache: CacheHandle,
        socket: Arc<RoomSocket>,
    ) {
        let mut rooms = self.inner.rooms.write().await;
        let state = rooms.entry(room_key.to_string()).or_insert_with(|| {
            let fanout = self.clone();
            let key = room_key.to_string();
            let chan = channel.to_string();
            let task = tokio::spawn(async move { fanout.subscribe(key, chan, cache).await });
            RoomState {
                sockets: HashMap::new(),
                subscriber: task,
            }
        });
        state.sockets.insert(socket.id, socket);
    }

    /// Removes a socket; the last socket out cancels the subscriber and
    /// drops the room entry.
    pub async fn leave(&self, room_key: &str, socket_id: Uuid) {
        let mut rooms = self.inner.rooms.write().await;
        let Some(state) = rooms.get_mut(room_key) else {
            return;
        };
        if let Some(socket) = state.sockets.remove(&socket_id) {
            socket.close().await;
        }
        if state.sockets.is_empty() {
            if let Some(state) = rooms.remove(room_key) {
                state.subscriber.abort();
            }
        }
    }

    async fn subscribe(&self, room_key: String, channel: String, cache: CacheHandle) {
        let mut pubsub = match cache.subscriber().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                warn!(room_key = %room_key, error = %err, "room subscriber connect failed");
                return;
            }
        };
        if let Err(err) = pubsub.subscribe(&channel).await {
            warn!(room_key = %room_key, error = %err, "room subscribe failed");
            return;
        }
        debug!(room_key = %room_key, channel = %channel, "room subscriber started");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            self.deliver(&room_key, payload).await;
        }
        debug!(room_key = %room_key, "room subscriber stopped");
    }

    /// Writes one received payload to every socket in the room, in order,
    /// under the read lock.
    async fn deliver(&self, room_key: &str, payload: String) {
        let rooms = self.inner.rooms.read().await;
        let Some(state) = rooms.get(room_key) else {
            return;
        };
        for socket in state.sockets.values() {
            if socket.send_text(payload.clone()).await {
                counter!("shoal_chat_fanout_delivered_total", 1);
            } else {
                counter!("shoal_chat_fanout_write_failures_total", 1);
            }
        }
    }

    pub async fn room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }

    pub async fn socket_count(&self, room_key: &str) -> usize {
        self.inner
            .rooms
            .read()
            .await
            .get(room_key)
            .map(|state| state.sockets.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn socket_delivers_in_order_through_its_channel() {
        let (tx, mut rx) = RoomSocket::channel();
        let socket = RoomSocket::new(tx);
        assert!(socket.send_text("one".into()).await);
        assert!(socket.send_text("two".into()).await);
        assert!(matches!(rx.recv().await, Some(Message::Text(t)) if t == "one"));
        assert!(matches!(rx.recv().await, Some(Message::Text(t)) if t == "two"));
    }

    #[tokio::test]
    async fn send_to_a_gone_socket_fails_fast() {
        let (tx, rx) = RoomSocket::channel();
        let socket = RoomSocket::new(tx);
        drop(rx);
        assert!(!socket.send_text("one".into()).await);
    }

    #[tokio::test]
    #[ignore]
    async fn fanout_round_trip_over_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let cache = CacheHandle::connect(&url).await.expect("redis");
        let fanout = RoomFanout::new();

        let room_id = Uuid::new_v4();
        let room_key = format!("t1:{room_id}");
        let channel = format!("tenant:t1:room:{room_id}");

        let (tx_a, mut rx_a) = RoomSocket::channel();
        let socket_a = RoomSocket::new(tx_a);
        let (tx_b, mut rx_b) = RoomSocket::channel();
        let socket_b = RoomSocket::new(tx_b);

        fanout
            .join(&room_key, &channel, cache.clone(), socket_a.clone())
            .await;
        fanout
            .join(&room_key, &channel, cache.clone(), socket_b.clone())
            .await;
        // One subscriber per room key no matter how many sockets join.
        assert_eq!(fanout.room_count().await, 1);
        assert_eq!(fanout.socket_count(&room_key).await, 2);

        // Give the subscriber time to attach before publishing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut conn = cache.manager();
        let _: () = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(r#"{"type":"message","payload":{"body":"hi"}}"#)
            .query_async(&mut conn)
            .await
            .expect("publish");

        let received = tokio::time::timeout(Duration::from_secs(2), rx_a.recv())
            .await
            .expect("socket a delivery");
        assert!(matches!(received, Some(Message::Text(t)) if t.contains("hi")));
        let received = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .expect("socket b delivery");
        assert!(matches!(received, Some(Message::Text(t)) if t.contains("hi")));

        fanout.leave(&room_key, socket_a.id()).await;
        assert_eq!(fanout.socket_count(&room_key).await, 1);
        fanout.leave(&room_key, socket_b.id()).await;
        assert_eq!(fanout.room_count().await, 0);
    }
}
