// 退出信号统一在这里监听，便于优雅停机。
use tracing::info;

/// 等待 Ctrl+C 或 SIGTERM，任一到达即返回，交给 axum 优雅收尾。
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            eprintln!("监听 Ctrl+C 失败: {err}");
        }
        "ctrl_c"
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                eprintln!("注册 SIGTERM 监听失败: {err}");
                std::future::pending::<()>().await;
            }
        }
        "sigterm"
    };

    #[cfg(not(unix))]
    let terminate = async {
        std::future::pending::<()>().await;
        "sigterm"
    };

    let trigger = tokio::select! {
        name = ctrl_c => name,
        name = terminate => name,
    };

    info!("收到 {trigger} 信号，准备关闭服务。");
}
