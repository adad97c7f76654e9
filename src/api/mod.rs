// API 路由汇总入口，按领域拆分以保持结构清晰。
pub mod chat;
pub mod errors;
pub mod health;
pub mod threads;

use crate::state::AppState;
use axum::Router;
use chrono::{DateTime, Utc};
use errors::ApiError;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .merge(health::router())
        .merge(threads::router())
        .merge(chat::router())
        .with_state(state)
}

/// 必填字段校验：去除空白后为空视同缺失。
pub(crate) fn require_field(value: Option<&str>, name: &str) -> Result<String, ApiError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::validation(format!("{name} is required")))
}

/// 存储层的 f64 秒时间戳在出口统一转成 RFC3339（UTC）。
pub(crate) fn format_ts(ts: f64) -> String {
    let millis = (ts * 1000.0) as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}
