use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use shoal_auth::{bearer_token, Claims};
use shoal_core::Message as ChatMessage;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::envelope::build_message_meta;
use crate::state::AppState;
use crate::ws::chat_ws_handler;

pub fn router(state: AppState, prometheus: PrometheusHandle) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/ws", get(chat_ws_handler))
        .route("/api/v1/rooms/:id/messages", post(create_room_message))
        .route("/api/v1/rooms/:id/read", post(mark_room_read))
        .route(
            "/api/internal/v1/tenants/:id/invalidate",
            post(invalidate_tenant),
        )
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

pub fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Claims, Response> {
    let token = bearer_token(headers, &HashMap::new())
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "bearer token is required"))?;
    state
        .auth
        .parse_token(&token)
        .map_err(|_| error_response(StatusCode::UNAUTHORIZED, "invalid token"))
}

#[derive(Deserialize)]
struct CreateMessageRequest {
    body: String,
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    file_ids: Vec<String>,
    #[serde(default)]
    emojis: Vec<String>,
}

async fn create_room_message(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateMessageRequest>,
) -> Response {
    let claims = match authorize(&state, &headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    if req.body.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "body required");
    }
    let msg = ChatMessage {
        tenant_id: claims.tenant_id,
        room_id,
        sender_id: claims.user_id,
        body: req.body,
        meta_json: build_message_meta(req.file_id.as_deref(), &req.file_ids, &req.emojis),
        ..Default::default()
    };
    match state.chat.create_message(msg).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

#[derive(Deserialize)]
struct MarkReadRequest {
    message_id: String,
}

async fn mark_room_read(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<MarkReadRequest>,
) -> Response {
    let claims = match authorize(&state, &headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    match state
        .chat
        .mark_read_up_to(&claims.tenant_id, &room_id, &claims.user_id, &req.message_id)
        .await
    {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn invalidate_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Response {
    state.tenants.invalidate(&tenant_id).await;
    info!(tenant_id = %tenant_id, "tenant bindings invalidated");
    Json(json!({"ok": true})).into_response()
}
