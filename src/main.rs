// Rust 入口：装配中间件、静态资源与 API 路由，然后启动服务。
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::FutureExt;
use std::any::Any as StdAny;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use warble_server::api;
use warble_server::config::{load_config, Config};
use warble_server::shutdown::shutdown_signal;
use warble_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    init_tracing(&config);
    let state = Arc::new(AppState::new(config.clone())?);

    // 挂载 API 路由与静态资源入口。
    let app = api::build_router(state.clone());
    let app = mount_static(app, "web", "/");

    let cors = build_cors(&config);
    let app = app
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(panic_guard))
        .with_state(state.clone());

    let addr = bind_address(&config);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("API 服务已启动: http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("服务退出异常: {err}");
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn bind_address(config: &Config) -> String {
    // 保留环境变量覆盖，便于容器化部署。
    let host = std::env::var("WARBLE_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("WARBLE_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}

fn mount_static<S>(app: Router<S>, dir: &str, route: &str) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let path = PathBuf::from(dir);
    if path.exists() {
        // 目录存在时才挂载，避免容器裁剪后启动报错。
        let service = ServeDir::new(path).append_index_html_on_directories(true);
        let trimmed = route.trim_end_matches('/');
        if trimmed.is_empty() {
            app.fallback_service(service)
        } else {
            let nested = Router::new().fallback_service(service);
            app.nest(&format!("{trimmed}/"), nested)
        }
    } else {
        app
    }
}

fn build_cors(config: &Config) -> CorsLayer {
    // 读取配置并转换为 tower-http 的 CORS 规则。
    let mut cors = CorsLayer::new();

    cors = match list_or_wildcard(config.cors.allow_origins.as_ref()) {
        ListRule::Wildcard => cors.allow_origin(Any),
        ListRule::Values(values) => {
            let parsed = values
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if parsed.is_empty() {
                cors
            } else {
                cors.allow_origin(AllowOrigin::list(parsed))
            }
        }
    };

    cors = match list_or_wildcard(config.cors.allow_methods.as_ref()) {
        ListRule::Wildcard => cors.allow_methods(Any),
        ListRule::Values(values) => {
            let parsed = values
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if parsed.is_empty() {
                cors
            } else {
                cors.allow_methods(AllowMethods::list(parsed))
            }
        }
    };

    cors = match list_or_wildcard(config.cors.allow_headers.as_ref()) {
        ListRule::Wildcard => cors.allow_headers(Any),
        ListRule::Values(values) => {
            let parsed = values
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if parsed.is_empty() {
                cors
            } else {
                cors.allow_headers(AllowHeaders::list(parsed))
            }
        }
    };

    if config.cors.allow_credentials.unwrap_or(false) {
        cors = cors.allow_credentials(true);
    }

    cors
}

enum ListRule<'a> {
    Wildcard,
    Values(&'a [String]),
}

fn list_or_wildcard(values: Option<&Vec<String>>) -> ListRule<'_> {
    match values {
        // 未配置视同放开，与配置 "*" 行为一致。
        None => ListRule::Wildcard,
        Some(items) if items.iter().any(|value| value == "*") => ListRule::Wildcard,
        Some(items) => ListRule::Values(items.as_slice()),
    }
}

async fn panic_guard(request: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let result = AssertUnwindSafe(next.run(request)).catch_unwind().await;
    match result {
        Ok(response) => Ok(response),
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!("panic while handling {method} {path}: {detail}");
            let payload = serde_json::json!({ "ok": false, "error": "internal server error" });
            Ok((StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response())
        }
    }
}

fn panic_message(panic: &(dyn StdAny + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
