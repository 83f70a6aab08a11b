// === Jemalloc 全局分配器配置（用于内存分析）===
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod api_keys;
pub mod assets;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod quota;
pub mod token_pool;
pub mod upstream;
pub mod util;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    let db = db::Db::open(cfg.db_path())
        .await
        .context("打开数据库失败")?;

    let state = gateway::AppState::new(cfg.clone(), db).context("初始化网关状态失败")?;

    // 凭证与 Key 文件只做增量导入，库中已有的失败/冷却状态保留
    match state.tokens.import_file(&cfg.tokens_file).await {
        Ok(n) if n > 0 => tracing::info!("导入凭证 {n} 个（{}）", cfg.tokens_file),
        Ok(_) => {}
        Err(e) => tracing::warn!("导入凭证文件失败: {e:#}"),
    }
    match state.keys.import_file(&cfg.api_keys_file).await {
        Ok(n) if n > 0 => tracing::info!("导入 API Key {n} 个（{}）", cfg.api_keys_file),
        Ok(_) => {}
        Err(e) => tracing::warn!("导入 API Key 文件失败: {e:#}"),
    }
    match state.tokens.count().await {
        Ok(0) => tracing::warn!("凭证池为空，所有上游请求将返回 503"),
        Ok(n) => tracing::info!("凭证池共 {n} 个凭证"),
        Err(e) => tracing::warn!("统计凭证数量失败: {e:#}"),
    }
    tracing::info!(
        "出图方式: {}，默认图片格式: {}",
        cfg.image_generation_method,
        cfg.image_format
    );

    let app = Router::new()
        .route("/debug/pprof/heap", get(handle_pprof_heap))
        .merge(gateway::build_router(Arc::new(state)));

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("服务异常退出")?;

    Ok(())
}

fn init_tracing(cfg: &config::Config) {
    // 依赖库默认只输出 warn；本项目自身至少 info，避免 RUST_LOG=warn 吞掉审计行
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,grok2api=info")
    } else if env.contains("grok2api") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},grok2api=info"))
    };

    if cfg.log_format.trim().eq_ignore_ascii_case("json") {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
        return;
    }

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

/// 导出 jemalloc 堆内存分析数据（pprof 格式）
/// 使用方式：
/// 1. curl http://localhost:PORT/debug/pprof/heap > heap.pb.gz
/// 2. go tool pprof -http=:8080 heap.pb.gz
#[cfg(not(target_env = "msvc"))]
async fn handle_pprof_heap() -> axum::response::Response {
    use axum::http::{StatusCode, header};
    use axum::response::IntoResponse;

    let Some(prof_ctl) = jemalloc_pprof::PROF_CTL.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "jemalloc profiling not enabled. Set MALLOC_CONF=prof:true before starting.",
        )
            .into_response();
    };

    let mut prof = prof_ctl.lock().await;
    match prof.dump_pprof() {
        Ok(pprof_data) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"heap.pb.gz\""),
            ],
            pprof_data,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to dump pprof: {e}"),
        )
            .into_response(),
    }
}

#[cfg(target_env = "msvc")]
async fn handle_pprof_heap() -> &'static str {
    "jemalloc profiling is not supported on MSVC targets"
}
