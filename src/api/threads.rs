// 线程 API：列出/创建/重命名线程，以及读取历史消息。
use crate::api::errors::ApiError;
use crate::api::{format_ts, require_field};
use crate::state::AppState;
use crate::storage::{normalize_title, MessageRecord, ThreadRecord};
use axum::extract::{Path as AxumPath, Query, State};
use axum::routing::{get, patch};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/threads", get(list_threads).post(create_thread))
        .route("/api/threads/{thread_id}", patch(rename_thread))
        .route("/api/history", get(get_history))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadListQuery {
    #[serde(default)]
    anon_user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateThreadRequest {
    #[serde(default)]
    anon_user_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameThreadRequest {
    #[serde(default)]
    anon_user_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    #[serde(default)]
    anon_user_id: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
}

async fn list_threads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ThreadListQuery>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_field(query.anon_user_id.as_deref(), "anonUserId")?;
    let threads = state
        .storage
        .list_threads(&user_id)
        .map_err(ApiError::storage)?;
    let items = threads.iter().map(thread_payload).collect::<Vec<_>>();
    Ok(Json(json!({ "ok": true, "threads": items })))
}

async fn create_thread(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateThreadRequest>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_field(payload.anon_user_id.as_deref(), "anonUserId")?;
    // 线程标识由服务端生成，客户端无法指定。
    let thread_id = format!("th_{}", Uuid::new_v4().simple());
    state
        .storage
        .create_thread(&thread_id, &user_id, payload.title.as_deref().unwrap_or(""))
        .map_err(ApiError::storage)?;
    Ok(Json(json!({ "ok": true, "threadId": thread_id })))
}

async fn rename_thread(
    State(state): State<Arc<AppState>>,
    AxumPath(thread_id): AxumPath<String>,
    Json(payload): Json<RenameThreadRequest>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_field(payload.anon_user_id.as_deref(), "anonUserId")?;
    let thread_id = require_field(Some(thread_id.as_str()), "threadId")?;
    let title = payload.title.as_deref().unwrap_or("");
    if normalize_title(title).is_none() {
        return Err(ApiError::validation("title must not be empty"));
    }
    let renamed = state
        .storage
        .rename_thread(&thread_id, &user_id, title)
        .map_err(ApiError::storage)?;
    if !renamed {
        // 不存在与非本人归属统一按 404 返回，避免探测线程存在性。
        return Err(ApiError::not_found("thread not found"));
    }
    Ok(Json(json!({ "ok": true })))
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_field(query.anon_user_id.as_deref(), "anonUserId")?;
    let thread_id = require_field(query.thread_id.as_deref(), "threadId")?;
    let owned = state
        .storage
        .thread_owned_by(&thread_id, &user_id)
        .map_err(ApiError::storage)?;
    if !owned {
        return Err(ApiError::not_found("thread not found"));
    }
    let messages = state
        .storage
        .get_history(&thread_id)
        .map_err(ApiError::storage)?;
    let items = messages.iter().map(message_payload).collect::<Vec<_>>();
    Ok(Json(json!({ "ok": true, "messages": items })))
}

fn thread_payload(record: &ThreadRecord) -> Value {
    json!({
        "id": record.thread_id,
        "title": record.title,
        "createdAt": format_ts(record.created_at),
        "updatedAt": format_ts(record.updated_at),
    })
}

fn message_payload(record: &MessageRecord) -> Value {
    json!({
        "id": record.msg_id,
        "role": record.role,
        "content": record.content,
        "createdAt": format_ts(record.created_at),
    })
}
