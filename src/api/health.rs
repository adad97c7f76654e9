// 健康检查：报告存储后端类型与可达性。
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/health", get(health))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.storage.health_check();
    Json(json!({
        "ok": true,
        "db": status.reachable,
        "kind": status.backend,
    }))
}
