use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use shoal_auth::{bearer_token, Claims};
use shoal_core::{ChatNotifyInput, NoteCreateInput};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::hub::SessionClient;
use crate::service::ServiceError;
use crate::state::AppState;

/// Idle sockets are considered dead after this long without a frame;
/// heartbeats double as session re-touches.
const SESSION_READ_DEADLINE: Duration = Duration::from_secs(90);

pub fn router(state: AppState, prometheus: PrometheusHandle) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/ws/session", get(session_ws_handler))
        .route("/api/v1/session/status", patch(update_session_status))
        .route("/api/v1/notes", post(send_note))
        .route("/api/v1/notes/inbox", get(list_inbox))
        .route("/api/v1/notes/:id/read", post(mark_note_read))
        .route("/api/v1/chat/notify", post(notify_chat))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus);

    Router::new()
        .merge(api)
        .merge(metrics_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

fn service_error_response(err: ServiceError) -> Response {
    match err {
        ServiceError::Validation(message) => error_response(StatusCode::BAD_REQUEST, &message),
        ServiceError::Store(err) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(Claims, String), Response> {
    let token = bearer_token(headers, &HashMap::new())
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "bearer token is required"))?;
    let claims = state
        .auth
        .parse_token(&token)
        .map_err(|_| error_response(StatusCode::UNAUTHORIZED, "invalid token"))?;
    Ok((claims, token))
}

async fn session_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let field = |name: &str| {
        params
            .get(name)
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    };
    let tenant_id = field("tenant_id");
    let user_id = field("user_id");
    let session_id = field("session_id");
    let session_token = field("session_token");

    match state
        .service
        .validate_session(&tenant_id, &user_id, &session_id, &session_token)
        .await
    {
        Ok(true) => {}
        Ok(false) => return error_response(StatusCode::UNAUTHORIZED, "unauthorized"),
        Err(err) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }

    ws.on_upgrade(move |socket| {
        handle_session_socket(socket, state, tenant_id, user_id, session_id, session_token)
    })
}

async fn handle_session_socket(
    socket: WebSocket,
    state: AppState,
    tenant_id: String,
    user_id: String,
    session_id: String,
    session_token: String,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = SessionClient::channel();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let client = SessionClient::new(
        tenant_id.clone(),
        user_id.clone(),
        session_id.clone(),
        tx,
    );
    state.hub.register(client.clone()).await;
    debug!(tenant_id = %tenant_id, user_id = %user_id, session_id = %session_id, "session socket connected");

    client
        .write_json(&json!({
            "type": "session.connected",
            "tenant_id": tenant_id,
            "user_id": user_id,
            "session_id": session_id,
            "connected_at": Utc::now(),
        }))
        .await;

    // The reader only detects disconnects and keeps the session touched.
    loop {
        match tokio::time::timeout(SESSION_READ_DEADLINE, stream.next()).await {
            Err(_) => break,
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(_))) => {
                // Re-touch the session; a definitive "invalid" closes the
                // socket, transient store errors do not.
                match state
                    .service
                    .validate_session(&tenant_id, &user_id, &session_id, &session_token)
                    .await
                {
                    Ok(false) => break,
                    Ok(true) | Err(_) => {}
                }
            }
        }
    }

    state.hub.unregister(&client).await;
    writer.abort();
    debug!(tenant_id = %tenant_id, user_id = %user_id, session_id = %session_id, "session socket disconnected");
}

#[derive(Deserialize)]
struct UpdateStatusRequest {
    status: String,
    #[serde(default)]
    status_note: String,
}

async fn update_session_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateStatusRequest>,
) -> Response {
    let (claims, _) = match authorize(&state, &headers) {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    match state
        .service
        .update_status(&claims.tenant_id, &claims.user_id, &req.status, &req.status_note)
        .await
    {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(err) => service_error_response(err),
    }
}

async fn send_note(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<NoteCreateInput>,
) -> Response {
    let (claims, _) = match authorize(&state, &headers) {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    match state
        .service
        .send_note(&claims.tenant_id, &claims.user_id, req)
        .await
    {
        Ok(note) => (StatusCode::CREATED, Json(note)).into_response(),
        Err(err) => service_error_response(err),
    }
}

async fn list_inbox(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let (claims, _) = match authorize(&state, &headers) {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    let limit = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(50);
    match state
        .service
        .list_inbox(&claims.tenant_id, &claims.user_id, limit)
        .await
    {
        Ok(items) => Json(items).into_response(),
        Err(err) => service_error_response(err),
    }
}

async fn mark_note_read(
    State(state): State<AppState>,
    Path(note_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let (claims, _) = match authorize(&state, &headers) {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    match state
        .service
        .mark_note_read(&claims.tenant_id, &claims.user_id, note_id.trim())
        .await
    {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(err) => service_error_response(err),
    }
}

async fn notify_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatNotifyInput>,
) -> Response {
    let (claims, token) = match authorize(&state, &headers) {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    match state
        .service
        .notify_chat(&claims.tenant_id, &claims.user_id, &token, req)
        .await
    {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(err) => service_error_response(err),
    }
}
