//! The chat WebSocket entry path: authenticate, verify membership, bind the
//! socket to the room fan-out, then drain client frames.

use std::collections::HashMap;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use redis::aio::ConnectionManager;
use serde_json::Value;
use shoal_auth::{bearer_token, Claims};
use shoal_core::Message as ChatMessage;
use tracing::{debug, error, info, warn};

use crate::envelope::{build_message_meta, error_frame, parse_message_payload, WsEnvelope};
use crate::fanout::RoomSocket;
use crate::idempotency::{self, idempotency_key, GateOutcome};
use crate::routes::error_response;
use crate::state::AppState;

pub async fn chat_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let Some(token) = bearer_token(&headers, &params) else {
        return error_response(StatusCode::UNAUTHORIZED, "bearer token is required");
    };
    let claims = match state.auth.parse_token(&token) {
        Ok(claims) => claims,
        Err(_) => return error_response(StatusCode::UNAUTHORIZED, "invalid token"),
    };
    let room_id = match params
        .get("room_id")
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
    {
        Some(room_id) => room_id.to_string(),
        None => return error_response(StatusCode::BAD_REQUEST, "room_id required"),
    };

    match state
        .chat
        .is_room_member(&claims.tenant_id, &room_id, &claims.user_id)
        .await
    {
        Ok(true) => {}
        Ok(false) => return error_response(StatusCode::FORBIDDEN, "room access denied"),
        Err(err) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }

    // Empty tenant ids resolve to the shared cache; the room key still gets
    // an explicit namespace so channels never collapse together.
    let cache = match state.tenants.cache().resolve(&claims.tenant_id).await {
        Ok(cache) => cache,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };
    let tenant_key = match claims.tenant_id.trim() {
        "" => "default".to_string(),
        id => id.to_string(),
    };

    ws.on_upgrade(move |socket| {
        handle_chat_socket(socket, state, claims, tenant_key, room_id, cache)
    })
}

async fn handle_chat_socket(
    socket: WebSocket,
    state: AppState,
    claims: Claims,
    tenant_id: String,
    room_id: String,
    cache: shoal_tenant::CacheHandle,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = RoomSocket::channel();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });
    let socket_handle = RoomSocket::new(tx);

    let room_key = format!("{tenant_id}:{room_id}");
    let channel = format!("tenant:{tenant_id}:room:{room_id}");
    state
        .fanout
        .join(&room_key, &channel, cache.clone(), socket_handle.clone())
        .await;
    debug!(tenant_id = %tenant_id, room_id = %room_id, user_id = %claims.user_id, "chat socket connected");

    let mut publish_conn = cache.manager();
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        // Decode errors are dropped without a reply.
        let Ok(mut env) = serde_json::from_str::<WsEnvelope>(&text) else {
            continue;
        };
        env.room_id = room_id.clone();
        env.user_id = claims.user_id.clone();

        if env.kind == "message" {
            match handle_message_frame(
                &state,
                &mut publish_conn,
                &tenant_id,
                &room_id,
                &claims.user_id,
                &env.payload,
            )
            .await
            {
                Ok(record) => env.payload = record,
                Err(message) => {
                    let _ = socket_handle.send_text(error_frame(&message)).await;
                    continue;
                }
            }
        }
        env.apply_signal_prefix();

        match serde_json::to_string(&env) {
            Ok(raw) => {
                let published: Result<(), redis::RedisError> = redis::cmd("PUBLISH")
                    .arg(&channel)
                    .arg(raw)
                    .query_async(&mut publish_conn)
                    .await;
                if let Err(err) = published {
                    warn!(channel = %channel, error = %err, "room publish failed");
                }
            }
            Err(err) => warn!(error = %err, "envelope serialize failed"),
        }
    }

    state.fanout.leave(&room_key, socket_handle.id()).await;
    writer.abort();
    debug!(tenant_id = %tenant_id, room_id = %room_id, user_id = %claims.user_id, "chat socket disconnected");
}

/// Runs one inbound `message` frame through the idempotency gate and the
/// pipeline. The returned value replaces the envelope payload; errors are
/// reported only to the originating socket.
async fn handle_message_frame(
    state: &AppState,
    conn: &mut ConnectionManager,
    tenant_id: &str,
    room_id: &str,
    user_id: &str,
    payload: &Value,
) -> Result<Value, String> {
    let started = Instant::now();
    let parsed = parse_message_payload(payload).map_err(str::to_string)?;

    let gate_key = if parsed.client_msg_id.is_empty() {
        None
    } else {
        Some(idempotency_key(
            tenant_id,
            room_id,
            user_id,
            &parsed.client_msg_id,
        ))
    };
    if let Some(key) = &gate_key {
        match idempotency::acquire(conn, key).await {
            Ok(GateOutcome::Created) => {}
            Ok(GateOutcome::Duplicate) => return Err("duplicate client_msg_id".to_string()),
            Err(err) => {
                warn!(error = %err, "idempotency acquire failed");
                return Err("failed to process message".to_string());
            }
        }
    }

    let msg = ChatMessage {
        tenant_id: tenant_id.to_string(),
        room_id: room_id.to_string(),
        sender_id: user_id.to_string(),
        body: parsed.body.clone(),
        meta_json: build_message_meta(parsed.file_id.as_deref(), &parsed.file_ids, &parsed.emojis),
        ..Default::default()
    };
    match state.chat.create_message(msg).await {
        Ok(created) => {
            info!(
                event = "chat_message_persist",
                status = "ok",
                source = "ws",
                tenant_id = %tenant_id,
                room_id = %room_id,
                user_id = %user_id,
                message_id = %created.id,
                client_msg_id_present = gate_key.is_some(),
                latency_ms = started.elapsed().as_millis() as u64,
                "message persisted"
            );
            serde_json::to_value(&created).map_err(|_| "failed to persist message".to_string())
        }
        Err(err) => {
            error!(
                event = "chat_message_persist",
                status = "failed",
                source = "ws",
                tenant_id = %tenant_id,
                room_id = %room_id,
                user_id = %user_id,
                client_msg_id_present = gate_key.is_some(),
                latency_ms = started.elapsed().as_millis() as u64,
                error = %err,
                "message persist failed"
            );
            // Release the gate so the client can retry the same id.
            if let Some(key) = &gate_key {
                idempotency::release(conn, key).await;
            }
            Err("failed to persist message".to_string())
        }
    }
}
