pub mod config;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod perplexity;
pub mod registry;
pub mod util;

use anyhow::Context;
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing();

    if cfg.api_key_is_placeholder() {
        tracing::warn!("PPLX_OPENAI_KEY 未设置且未提供 --api-key，正在使用占位密钥");
    }

    // 注册表只在启动时构建一次；为空只告警，不阻塞启动。
    let registry = registry::ModelRegistry::build(&cfg.model_prefix);
    if registry.is_empty() {
        tracing::warn!("没有可用的模型 ID，/v1/models 将返回空列表");
    } else if let Some(id) = registry.default_id() {
        tracing::info!("模型注册完成：共 {} 个，默认 {id}", registry.ids().len());
    }

    // Cookie 加载失败只降级为无凭证运行。
    let cookies = credential::load_cookies(&cfg.cookies_file);
    let has_cookies = cookies.is_some();

    let client =
        perplexity::Client::new(&cfg, cookies).context("初始化 Perplexity 客户端失败")?;

    tracing::info!(
        "启动参数：端口 {}，模型前缀 {}，语言 {}，隐身模式 {}，Cookie {}",
        cfg.port,
        cfg.model_prefix,
        cfg.language,
        cfg.incognito,
        if has_cookies { "已加载" } else { "未加载" }
    );

    let state = Arc::new(gateway::GatewayState {
        cfg: cfg.clone(),
        registry,
        perplexity: client,
    });

    // === 公开路由（不需要认证）===
    let public_routes = Router::new().route("/health", get(handle_health));

    // === API 路由（Bearer 认证）===
    let api_routes = Router::new()
        .route(
            "/v1/models",
            get(gateway::openai::handler::handle_list_models),
        )
        .route(
            "/v1/chat/completions",
            post(gateway::openai::handler::handle_chat_completions),
        )
        // 允许尾随斜杠的同一路径
        .route(
            "/v1/chat/completions/",
            post(gateway::openai::handler::handle_chat_completions),
        )
        .layer(axum::extract::DefaultBodyLimit::max(
            gateway::openai::handler::BODY_LIMIT,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gateway::auth::require_api_key,
        ))
        .with_state(state);

    let app = Router::new().merge(public_routes).merge(api_routes);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

async fn handle_health() -> &'static str {
    "ok"
}

fn init_tracing() {
    // DEBUG 只控制请求/响应详细块（见 logging::LogLevel），不影响过滤器。
    // 依赖库日志压到 warn，本项目自身日志保持至少 info，
    // 避免环境预设 RUST_LOG=warn 滤掉启动告警。
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,pplx2api=info")
    } else if env.contains("pplx2api") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},pplx2api=info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
