use std::any::Any;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use anyhow::{Context, Result};
use axum::http::Method;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::UploadError;
use crate::query::handle_query;
use crate::response::{xml_response, Encoding};
use crate::state::AppState;
use crate::upload::handle_upload;

/// GET 和 POST 共用同一个端点
pub fn router(state: AppState) -> Router {
    let path = state.config().path.clone();
    let routes = Router::new().route(&path, get(handle_query).post(handle_upload));
    with_layers(routes).with_state(state)
}

// panic 生成的 XML 也要经过 CORS 层，跨域页面才读得到
fn with_layers(routes: Router<AppState>) -> Router<AppState> {
    // 回显 Origin 并允许携带 cookie，预检请求直接由 CORS 层应答
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request());

    routes
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors)
}

// 处理过程中的 panic 同样返回一个 XML 文档
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "handler panicked");

    let err = UploadError::Malformed("internal error".to_string());
    xml_response(err.to_xml(Encoding::Plain), Encoding::Plain)
}

pub async fn run(config: Config) -> Result<()> {
    // 1. 准备存储根目录
    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("创建上传目录失败: {}", config.upload_dir.display()))?;

    // 2. 绑定端口
    let addr = config.bind;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("绑定地址失败: {addr}"))?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        addr = %local_addr,
        path = %config.path,
        upload_dir = %config.upload_dir.display(),
        "server running"
    );
    if let Some(local_ip) = get_local_ip() {
        tracing::info!("Access the endpoint at: http://{}:{}{}", local_ip, local_addr.port(), config.path);
    }

    // 3. 启动服务器
    let app = router(AppState::new(config));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

// 获取本地IP地址
fn get_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?; // 80主要是防止防火墙拦截

    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ipv4) if !ipv4.is_loopback() && ipv4 != Ipv4Addr::UNSPECIFIED => {
            Some(IpAddr::V4(ipv4))
        }
        _ => None,
    }
}

/// 在后台启动服务并返回实际监听地址
pub async fn spawn(config: Config) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    let addr = listener.local_addr()?;
    let app = router(AppState::new(config));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server stopped");
        }
    });
    Ok(addr)
}
