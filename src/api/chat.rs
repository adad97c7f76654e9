// 聊天 API：先落用户消息，经中继取应答，再落机器人消息。
use crate::api::errors::ApiError;
use crate::api::require_field;
use crate::state::AppState;
use crate::storage::MessageRole;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/chat", post(chat))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    #[serde(default)]
    anon_user_id: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_field(payload.anon_user_id.as_deref(), "anonUserId")?;
    let thread_id = require_field(payload.thread_id.as_deref(), "threadId")?;
    let text = payload.text.as_deref().unwrap_or("");
    if text.trim().is_empty() {
        return Err(ApiError::validation("text is required"));
    }
    // 配置缺失要在落库前拦下，否则会留下无应答的半截对话。
    if !state.relay.is_configured() {
        return Err(ApiError::configuration(
            "relay is not configured: missing endpoint or shared secret",
        ));
    }
    let owned = state
        .storage
        .thread_owned_by(&thread_id, &user_id)
        .map_err(ApiError::storage)?;
    if !owned {
        return Err(ApiError::not_found("thread not found"));
    }

    // 用户消息先于中继调用持久化；中继失败不回滚，
    // 客户端会看到一条没有应答的用户消息。
    let user_msg_id = format!("msg_{}", Uuid::new_v4().simple());
    state
        .storage
        .insert_message(&user_msg_id, &thread_id, MessageRole::User, Some(text))
        .map_err(ApiError::storage)?;
    state
        .storage
        .touch_thread(&thread_id)
        .map_err(ApiError::storage)?;

    let reply = state
        .relay
        .send(&user_id, &thread_id, text)
        .await
        .map_err(|err| ApiError::relay(err.to_string()))?;

    // 应答原样入库，缺失也照存，不做裁剪。
    let bot_msg_id = format!("msg_{}", Uuid::new_v4().simple());
    state
        .storage
        .insert_message(
            &bot_msg_id,
            &thread_id,
            MessageRole::Assistant,
            reply.as_deref(),
        )
        .map_err(ApiError::storage)?;
    state
        .storage
        .touch_thread(&thread_id)
        .map_err(ApiError::storage)?;

    Ok(Json(json!({ "ok": true, "reply": reply })))
}
