//! HTTP 入口：路由、鉴权与 CORS 中间件、各接口处理器。

pub mod common;
pub mod images;
pub mod openai;
pub mod uploads;

use crate::api_keys::{ApiKeyStore, Caller};
use crate::assets::AssetStore;
use crate::config::Config;
use crate::db::Db;
use crate::error::AppError;
use crate::quota::Ledger;
use crate::token_pool::{CooldownPolicy, TokenPool, policy_from_name};
use crate::upstream::GrokClient;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{DefaultBodyLimit, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// JSON 请求体上限。
const JSON_BODY_LIMIT: usize = 64 * 1024 * 1024;
/// multipart 上限：16 张 × 50MB，外加表单开销。
const MULTIPART_BODY_LIMIT: usize = 16 * 50 * 1024 * 1024 + 1024 * 1024;

pub struct AppState {
    pub cfg: Config,
    pub client: GrokClient,
    pub tokens: TokenPool,
    pub ledger: Ledger,
    pub keys: ApiKeyStore,
    pub assets: AssetStore,
}

impl AppState {
    pub fn new(cfg: Config, db: Db) -> anyhow::Result<Self> {
        let client = GrokClient::new(&cfg)?;
        let tokens = TokenPool::new(db.clone(), CooldownPolicy::new(cfg.cooldown))
            .with_policy(policy_from_name(&cfg.token_selection));
        let assets = AssetStore::new(Duration::from_secs(cfg.asset_ttl_secs), &cfg.app_url);
        Ok(Self {
            client,
            tokens,
            ledger: Ledger::new(db.clone()),
            keys: ApiKeyStore::new(db),
            assets,
            cfg,
        })
    }
}

/// `/v1` 下的全部接口；鉴权只包住 API 路由，文件读取公开（随机文件名即凭据），CORS 包在最外层。
pub fn build_router(state: Arc<AppState>) -> Router {
    let json_routes = Router::new()
        .route("/models", get(openai::handler::handle_list_models))
        .route("/models/{id}", get(openai::handler::handle_get_model))
        .route("/chat/completions", post(openai::handler::handle_chat_completions))
        .route("/images/generations", post(images::handler::handle_generations))
        .route("/images/method", get(images::handler::handle_method))
        .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT));

    let multipart_routes = Router::new()
        .route("/images/edits", post(images::handler::handle_edits))
        .route("/uploads/image", post(uploads::handle_upload_image))
        .layer(DefaultBodyLimit::max(MULTIPART_BODY_LIMIT));

    let api = Router::new()
        .merge(json_routes)
        .merge(multipart_routes)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .route("/files/image/{name}", get(uploads::handle_get_file))
        .with_state(state);

    Router::new()
        .route("/health", get(handle_health))
        .nest("/v1", api)
        .layer(middleware::from_fn(cors_middleware))
}

async fn handle_health() -> &'static str {
    "ok"
}

/// 解析 `Authorization: Bearer <key>`：
/// - 等于 API_KEY：管理员，不计额度
/// - 库中启用的 Key：按 Key 计额度
/// - 既没配 API_KEY 也没有任何 Key：匿名放行
pub async fn resolve_caller(state: &AppState, bearer: Option<&str>) -> Result<Caller, AppError> {
    let bearer = bearer.map(str::trim).filter(|s| !s.is_empty());
    let admin = state.cfg.api_key.as_str();

    if let Some(key) = bearer {
        if !admin.is_empty() && key == admin {
            return Ok(Caller::Admin);
        }
        if let Some(row) = state.keys.get(key).await?
            && row.is_active
        {
            return Ok(Caller::Key(row));
        }
    }

    if admin.is_empty() && state.keys.count().await? == 0 {
        return Ok(Caller::Anonymous);
    }

    Err(match bearer {
        None => AppError::unauthorized("Missing API key"),
        Some(_) => AppError::unauthorized("Invalid API key"),
    })
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).to_string());

    match resolve_caller(&state, bearer.as_deref()).await {
        Ok(caller) => {
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

/// 宽松 CORS；预检直接 204，不进入鉴权。
pub async fn cors_middleware(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut resp = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(resp.headers_mut());
        return resp;
    }
    let mut resp = next.run(req).await;
    apply_cors_headers(resp.headers_mut());
    resp
}

fn apply_cors_headers(h: &mut axum::http::HeaderMap) {
    h.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    h.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    h.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    h.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
}

/// 调用方 IP：优先反代头，其次 TCP 对端地址。
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(ip) = forwarded {
            return Ok(Self(ip.to_string()));
        }
        if let Some(ip) = parts
            .headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            return Ok(Self(ip.to_string()));
        }
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self(peer))
    }
}
