// 统一错误封装：所有失败一律返回 {ok:false, error} JSON 信封。
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub(crate) const ERROR_CODE_HEADER: &str = "x-error-code";

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
}

impl ApiError {
    fn new(code: &'static str, message: String, status: StatusCode) -> Self {
        Self {
            code,
            message,
            status,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("INVALID_REQUEST", message.into(), StatusCode::BAD_REQUEST)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message.into(), StatusCode::NOT_FOUND)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(
            "CONFIG_MISSING",
            message.into(),
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    }

    pub fn relay(message: impl Into<String>) -> Self {
        Self::new(
            "RELAY_FAILED",
            message.into(),
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    }

    // 不向客户端透出后端内部结构，只保留一条消息文本。
    pub fn storage(err: anyhow::Error) -> Self {
        Self::new(
            "STORAGE_FAILED",
            err.to_string(),
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = json!({ "ok": false, "error": self.message });
        let mut response = (self.status, Json(payload)).into_response();
        if let Ok(value) = HeaderValue::from_str(self.code) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(ERROR_CODE_HEADER), value);
        }
        response
    }
}
