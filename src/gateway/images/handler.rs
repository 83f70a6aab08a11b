use super::form::{read_edit_form, validate_edit_images};
use super::strategy::{self, ImageJob, MAX_IMAGES, Strategy, pick_images};
use super::stream::stream_images;
use super::types::{ImageGenerationRequest, ImageMethodResponse, ImageUsage, ImagesResponse};
use crate::api_keys::Caller;
use crate::assets::AssetFormat;
use crate::config::Config;
use crate::error::AppError;
use crate::gateway::common::extract::MediaRef;
use crate::gateway::common::media::upload_media;
use crate::gateway::common::run_attempts;
use crate::gateway::openai::convert::now_unix;
use crate::gateway::openai::handler::fail;
use crate::gateway::{AppState, ClientIp};
use crate::logging::{self, AuditGuard};
use crate::quota::enforce_daily_quota;
use crate::upstream::{UploadedFile, UpstreamError};
use crate::util::model::{self, IMAGE_EDIT_MODEL, IMAGE_GENERATION_MODEL};
use axum::Extension;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Multipart, OriginalUri, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// 生成与编辑两个入口解析后的统一请求。
struct ImageRequest {
    job: ImageJob,
    stream: bool,
    format: AssetFormat,
    media: Vec<MediaRef>,
}

/// 流式尝试成功后的产物：实际打开的通道、上游响应与已上传的参考图。
struct OpenedStream {
    strategy: Strategy,
    resp: reqwest::Response,
    refs: Vec<UploadedFile>,
}

pub async fn handle_method(State(state): State<Arc<AppState>>) -> Json<ImageMethodResponse> {
    Json(ImageMethodResponse {
        image_generation_method: state.cfg.image_generation_method.clone(),
    })
}

pub async fn handle_generations(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    Extension(caller): Extension<Caller>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let log_level = state.cfg.log_level();
    if log_level.client_enabled() {
        if log_level.raw_enabled() {
            logging::client_request_raw(method.as_str(), uri.0.path(), &headers, body.as_ref());
        } else {
            logging::client_request(method.as_str(), uri.0.path(), &headers, body.as_ref());
        }
    }

    let mut audit = AuditGuard::new(ip, IMAGE_GENERATION_MODEL, caller.key_name());
    let req: ImageGenerationRequest = match sonic_rs::from_slice(body.as_ref()) {
        Ok(v) => v,
        Err(_) => return fail(&state, audit, AppError::bad_request("Invalid JSON body"), start),
    };
    let model_id = req.model.clone().unwrap_or_else(|| IMAGE_GENERATION_MODEL.to_string());
    audit.set_model(model_id.as_str());

    let parsed = build_request(
        &state.cfg,
        &model_id,
        IMAGE_GENERATION_MODEL,
        req.prompt,
        req.n,
        req.size.as_deref(),
        req.response_format.as_deref(),
        req.stream.unwrap_or(false),
        req.concurrency,
        Vec::new(),
    );
    match parsed {
        Ok(r) => run_image_request(state, caller, r, audit, start).await,
        Err(e) => fail(&state, audit, e, start),
    }
}

pub async fn handle_edits(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    Extension(caller): Extension<Caller>,
    multipart: Multipart,
) -> Response {
    let start = Instant::now();
    let mut audit = AuditGuard::new(ip, IMAGE_EDIT_MODEL, caller.key_name());
    let form = match read_edit_form(multipart).await {
        Ok(f) => f,
        Err(e) => return fail(&state, audit, e, start),
    };
    let model_id = form.model.clone().unwrap_or_else(|| IMAGE_EDIT_MODEL.to_string());
    audit.set_model(model_id.as_str());
    if state.cfg.log_level().client_enabled() {
        tracing::info!(
            model = %model_id,
            images = form.images.len(),
            n = ?form.n,
            stream = ?form.stream,
            "[客户端请求] POST /v1/images/edits"
        );
    }

    let media = match validate_edit_images(&form.images) {
        Ok(m) => m,
        Err(e) => return fail(&state, audit, e, start),
    };
    let parsed = build_request(
        &state.cfg,
        &model_id,
        IMAGE_EDIT_MODEL,
        form.prompt,
        form.n,
        form.size.as_deref(),
        form.response_format.as_deref(),
        form.stream.unwrap_or(false),
        None,
        media,
    );
    match parsed {
        Ok(r) => run_image_request(state, caller, r, audit, start).await,
        Err(e) => fail(&state, audit, e, start),
    }
}

/// 未指定时使用配置默认值；experimental 通道下默认的 url 改为 b64_json。
pub fn resolve_format(cfg: &Config, raw: Option<&str>) -> Result<AssetFormat, AppError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(v) => AssetFormat::parse(v).ok_or_else(|| {
            AppError::bad_request_code(
                "response_format must be one of url, base64, b64_json",
                "invalid_response_format",
            )
        }),
        None => {
            let default = AssetFormat::parse(&cfg.image_format).unwrap_or(AssetFormat::Url);
            if default == AssetFormat::Url && cfg.prefers_experimental_images() {
                Ok(AssetFormat::B64Json)
            } else {
                Ok(default)
            }
        }
    }
}

pub fn resolve_n(n: Option<i64>) -> usize {
    n.unwrap_or(1).clamp(1, MAX_IMAGES as i64) as usize
}

#[allow(clippy::too_many_arguments)]
fn build_request(
    cfg: &Config,
    model_id: &str,
    required_model: &str,
    prompt: String,
    n: Option<i64>,
    size: Option<&str>,
    response_format: Option<&str>,
    stream: bool,
    concurrency: Option<usize>,
    media: Vec<MediaRef>,
) -> Result<ImageRequest, AppError> {
    let model = model::get(model_id).ok_or_else(|| AppError::ModelNotFound(model_id.to_string()))?;
    if model.id != required_model {
        return Err(AppError::bad_request_code(
            format!("The model `{model_id}` is not supported here. Use `{required_model}`."),
            "invalid_model",
        ));
    }

    let prompt = prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(AppError::bad_request_code("Prompt cannot be empty", "empty_prompt"));
    }

    let n = resolve_n(n);
    if stream && !(1..=2).contains(&n) {
        return Err(AppError::bad_request_code(
            "Streaming is only supported when n=1 or n=2",
            "invalid_stream_n",
        ));
    }
    let format = resolve_format(cfg, response_format)?;

    Ok(ImageRequest {
        job: ImageJob {
            model,
            prompt,
            aspect_ratio: strategy::aspect_ratio(size).to_string(),
            n,
            concurrency: concurrency.unwrap_or(cfg.image_concurrency).clamp(1, 3),
            edit: required_model == IMAGE_EDIT_MODEL,
        },
        stream,
        format,
        media,
    })
}

async fn run_image_request(
    state: Arc<AppState>,
    caller: Caller,
    req: ImageRequest,
    mut audit: AuditGuard,
    start: Instant,
) -> Response {
    if let Err(e) = enforce_daily_quota(
        &state.ledger,
        &state.keys,
        state.cfg.tz_offset_minutes,
        &caller,
        req.job.model,
        Some(req.job.n as i64),
    )
    .await
    {
        return fail(&state, audit, e, start);
    }

    let preferred = Strategy::preferred(&state.cfg);
    let log_raw = state.cfg.log_level().raw_enabled();
    let st = &*state;
    let job = &req.job;
    let media = &req.media;

    if req.stream {
        let opened = run_attempts(&st.cfg, &st.tokens, job.model, &mut audit, |tok| async move {
            let refs = upload_media(&st.client, &tok.token, media, st.cfg.upload_concurrency).await?;
            let (strategy, resp) = strategy::open_stream(&st.client, &tok.token, preferred, job, &refs).await?;
            Ok::<_, UpstreamError>(OpenedStream { strategy, resp, refs })
        })
        .await;
        return match opened {
            Ok(a) => stream_images(
                state.clone(),
                a.value.strategy,
                a.value.resp,
                a.token,
                req.job.clone(),
                a.value.refs,
                req.format,
                audit,
            ),
            Err(e) => fail(&state, audit, e, start),
        };
    }

    let generated = run_attempts(&st.cfg, &st.tokens, job.model, &mut audit, |tok| async move {
        let refs = upload_media(&st.client, &tok.token, media, st.cfg.upload_concurrency).await?;
        strategy::generate_with_fallback(&st.client, &tok.token, preferred, job, &refs, log_raw).await
    })
    .await;
    let generated = match generated {
        Ok(v) => v,
        Err(e) => return fail(&state, audit, e, start),
    };

    let picked = pick_images(generated.value, job.n);
    let converted = state
        .assets
        .convert_all(&state.client, &generated.token, &picked, req.format)
        .await;
    let field = req.format.field();
    let out = ImagesResponse {
        created: now_unix(),
        data: converted
            .into_iter()
            .map(|v| BTreeMap::from([(field, v)]))
            .collect(),
        usage: ImageUsage::default(),
    };

    if state.cfg.log_level().client_enabled() {
        tracing::info!(
            status = StatusCode::OK.as_u16(),
            duration_ms = logging::format_duration_ms(start.elapsed()),
            images = out.data.len(),
            "[客户端响应] images"
        );
    }
    audit.success(StatusCode::OK.as_u16());
    (StatusCode::OK, Json(out)).into_response()
}
