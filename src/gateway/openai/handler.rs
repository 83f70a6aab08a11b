use super::convert::{
    image_markdown, model_item, now_unix, resolve_video_params, to_chat_completion,
    to_models_response, video_markdown,
};
use super::stream::{StreamWriter, sse_error_events};
use super::types::ChatRequest;
use crate::api_keys::Caller;
use crate::assets::{AssetFormat, ERROR_PLACEHOLDER};
use crate::error::AppError;
use crate::gateway::common::extract::{ExtractedPrompt, extract_prompt};
use crate::gateway::common::media::upload_media;
use crate::gateway::common::{record_upstream_failure, run_attempts, upstream_app_error};
use crate::gateway::{AppState, ClientIp};
use crate::logging::{self, AuditGuard};
use crate::quota::enforce_daily_quota;
use crate::upstream::payload::{ChatPayload, PostPayload, VideoParams};
use crate::upstream::stream::{self as upstream_stream, Collected};
use crate::upstream::{UpstreamError, UpstreamEvent};
use crate::util::id;
use crate::util::model::{self, ModelInfo};
use axum::Extension;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

pub async fn handle_list_models() -> Response {
    (StatusCode::OK, Json(to_models_response(model::list()))).into_response()
}

pub async fn handle_get_model(Path(id): Path<String>) -> Result<Response, AppError> {
    let m = model::get(&id).ok_or(AppError::ModelNotFound(id))?;
    Ok((StatusCode::OK, Json(model_item(m))).into_response())
}

/// 一次成功尝试的产物：流式只打开连接，非流式已读完整条流。
enum Opened {
    Stream(reqwest::Response),
    Done(Collected),
}

pub async fn handle_chat_completions(
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

    let mut audit = AuditGuard::new(ip, "", caller.key_name());
    let req: ChatRequest = match sonic_rs::from_slice(body.as_ref()) {
        Ok(v) => v,
        Err(_) => return fail(&state, audit, AppError::bad_request("Invalid JSON body"), start),
    };
    audit.set_model(req.model.as_str());
    let model = match model::get(&req.model) {
        Some(m) => m,
        None => return fail(&state, audit, AppError::ModelNotFound(req.model.clone()), start),
    };

    let is_stream = req.stream.unwrap_or(false);
    let attempted = match open_chat(&state, &caller, model, &req, is_stream, &mut audit).await {
        Ok(v) => v,
        Err(e) => return fail(&state, audit, e, start),
    };

    match attempted.value {
        Opened::Stream(resp) => stream_chat(state, resp, attempted.token, model.id, audit, start),
        Opened::Done(collected) => {
            let links: Vec<String> = state
                .assets
                .convert_all(&state.client, &attempted.token, &collected.image_urls, AssetFormat::Url)
                .await
                .into_iter()
                .filter(|v| v != ERROR_PLACEHOLDER)
                .collect();
            let video = match collected.video_url.as_deref() {
                Some(raw) => convert_link(&state, &attempted.token, raw).await,
                None => None,
            };

            let out = to_chat_completion(
                id::chat_completion_id(),
                model.id,
                &collected,
                &links,
                video.as_deref(),
            );
            if log_level.client_enabled()
                && let Ok(v) = sonic_rs::to_value(&out)
            {
                logging::client_response(StatusCode::OK.as_u16(), start.elapsed(), Some(&v));
            }
            audit.success(StatusCode::OK.as_u16());
            (StatusCode::OK, Json(out)).into_response()
        }
    }
}

async fn open_chat(
    state: &AppState,
    caller: &Caller,
    model: &'static ModelInfo,
    req: &ChatRequest,
    is_stream: bool,
    audit: &mut AuditGuard,
) -> Result<crate::gateway::common::Attempted<Opened>, AppError> {
    let prompt = extract_prompt(&req.messages, |m| m.role.as_str(), |m| &m.content)?;
    let video = if model.is_video {
        Some(resolve_video_params(req.video_config.as_ref())?)
    } else {
        None
    };

    enforce_daily_quota(
        &state.ledger,
        &state.keys,
        state.cfg.tz_offset_minutes,
        caller,
        model,
        None,
    )
    .await?;

    let raw_log = state.cfg.log_level().raw_enabled();
    let prompt = &prompt;
    let video = video.as_ref();
    run_attempts(&state.cfg, &state.tokens, model, audit, |tok| async move {
        let payload = build_payload(state, &tok.token, model, prompt, video).await?;
        let resp = state.client.chat_stream(&tok.token, &payload).await?;
        if is_stream {
            return Ok::<_, UpstreamError>(Opened::Stream(resp));
        }
        let collected = upstream_stream::collect(upstream_stream::events(resp.bytes_stream(), raw_log)).await?;
        Ok::<_, UpstreamError>(Opened::Done(collected))
    })
    .await
}

/// 按模型构造上游请求体；视频先建立 post 上下文，其它模型先上传附件。
async fn build_payload(
    state: &AppState,
    token: &str,
    model: &ModelInfo,
    prompt: &ExtractedPrompt,
    video: Option<&VideoParams>,
) -> Result<ChatPayload, UpstreamError> {
    if let Some(params) = video {
        let post = match prompt.media.first() {
            Some(first) => {
                if prompt.media.len() > 1 {
                    tracing::debug!("视频生成只使用第一张图片，忽略其余 {} 张", prompt.media.len() - 1);
                }
                let uploaded = upload_media(&state.client, token, std::slice::from_ref(first), 1).await?;
                let uri = uploaded.first().map(|f| f.file_uri.clone()).unwrap_or_default();
                PostPayload::from_media(state.client.asset_url(&uri))
            }
            None => PostPayload::from_prompt(&prompt.text),
        };
        let post_id = state.client.create_post(token, &post).await?;
        return Ok(ChatPayload::video(&prompt.text, &post_id, params));
    }

    let uploaded = upload_media(&state.client, token, &prompt.media, state.cfg.upload_concurrency).await?;
    let file_ids = uploaded.into_iter().map(|f| f.file_metadata_id).collect();
    Ok(ChatPayload::new(model.upstream_model, model.upstream_mode, prompt.text.clone()).with_attachments(file_ids))
}

async fn convert_link(state: &AppState, token: &str, raw: &str) -> Option<String> {
    match state.assets.convert(&state.client, token, raw, AssetFormat::Url).await {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("资源转换失败: {}", e.log_message());
            None
        }
    }
}

/// 单个上游事件 → 若干 SSE data。
async fn translate_event(
    state: &AppState,
    token: &str,
    writer: &mut StreamWriter,
    ev: UpstreamEvent,
) -> Vec<String> {
    match ev {
        UpstreamEvent::Token { text, thinking: true } => writer.reasoning(&text),
        UpstreamEvent::Token { text, thinking: false } => writer.content(&text),
        UpstreamEvent::ImageProgress { .. } => Vec::new(),
        UpstreamEvent::ImageDone { url, .. } => match convert_link(state, token, &url).await {
            Some(link) => writer.content(&image_markdown(&link)),
            None => Vec::new(),
        },
        UpstreamEvent::VideoProgress {
            video_url: Some(url),
            ..
        } => match convert_link(state, token, &url).await {
            Some(link) => writer.content(&video_markdown(&link)),
            None => Vec::new(),
        },
        UpstreamEvent::VideoProgress { progress, .. } => {
            writer.reasoning(&format!("Video generation progress: {progress}%\n"))
        }
        UpstreamEvent::ModelResponse { message, image_urls } => {
            let mut out = Vec::new();
            // 没有逐 token 输出时以最终消息补齐正文
            if writer.logged_text().0.is_empty() {
                out.extend(writer.content(&message));
            }
            for url in image_urls {
                if let Some(link) = convert_link(state, token, &url).await {
                    out.extend(writer.content(&image_markdown(&link)));
                }
            }
            out
        }
    }
}

async fn send_all(tx: &mpsc::Sender<Result<Event, Infallible>>, events: Vec<String>) -> bool {
    for ev in events {
        if tx.send(Ok(Event::default().data(ev))).await.is_err() {
            return false;
        }
    }
    true
}

pub(crate) fn sse_response(rx: mpsc::Receiver<Result<Event, Infallible>>) -> Response {
    (
        [
            (CACHE_CONTROL, "no-cache"),
            (CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(ReceiverStream::new(rx)),
    )
        .into_response()
}

enum Relayed {
    Finished,
    Failed(UpstreamError),
    ClientGone,
}

/// 逐事件转发到客户端；客户端断开即停止读取上游。
async fn relay<S>(
    state: &AppState,
    token: &str,
    writer: &mut StreamWriter,
    events: S,
    tx: &mpsc::Sender<Result<Event, Infallible>>,
    log_raw: bool,
) -> Relayed
where
    S: futures::Stream<Item = Result<UpstreamEvent, UpstreamError>>,
{
    futures::pin_mut!(events);
    loop {
        let item = tokio::select! {
            item = events.next() => item,
            _ = tx.closed() => return Relayed::ClientGone,
        };
        let ev = match item {
            Some(Ok(ev)) => ev,
            Some(Err(e)) => return Relayed::Failed(e),
            None => return Relayed::Finished,
        };
        let chunks = translate_event(state, token, writer, ev).await;
        if log_raw {
            for c in &chunks {
                logging::client_stream_event_raw(None, c);
            }
        }
        if !send_all(tx, chunks).await {
            return Relayed::ClientGone;
        }
    }
}

fn stream_chat(
    state: Arc<AppState>,
    resp: reqwest::Response,
    token: String,
    model: &'static str,
    audit: AuditGuard,
    started_at: Instant,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(256);

    tokio::spawn(async move {
        let log_level = state.cfg.log_level();
        let mut writer = StreamWriter::new(id::chat_completion_id(), now_unix(), model.to_string());

        let events = upstream_stream::events(resp.bytes_stream(), log_level.raw_enabled());
        match relay(&state, &token, &mut writer, events, &tx, log_level.raw_enabled()).await {
            Relayed::Finished => {
                send_all(&tx, writer.finish_events()).await;
                audit.success(StatusCode::OK.as_u16());
            }
            Relayed::Failed(e) => {
                record_upstream_failure(&state.tokens, &token, &e).await;
                let app = upstream_app_error(&e);
                send_all(&tx, sse_error_events(&app.client_message(), app.code())).await;
                audit.failure(app.status().as_u16(), &app.log_message());
            }
            Relayed::ClientGone => {
                audit.failure(499, "client disconnected");
                return;
            }
        }

        if log_level.client_enabled() {
            let (text, reasoning) = writer.logged_text();
            logging::client_stream_response(StatusCode::OK.as_u16(), started_at.elapsed(), text, reasoning);
        }
    });

    sse_response(rx)
}

/// 终止于错误：记客户端日志与审计，再返回标准错误体。
pub(crate) fn fail(state: &AppState, audit: AuditGuard, err: AppError, started_at: Instant) -> Response {
    let status = err.status();
    let log_level = state.cfg.log_level();
    if log_level.client_enabled() {
        let body = sonic_rs::json!({
            "error": {
                "message": err.client_message(),
                "type": "invalid_request_error",
                "code": err.code(),
            }
        });
        logging::client_response(status.as_u16(), started_at.elapsed(), Some(&body));
    }
    audit.failure(status.as_u16(), &err.log_message());
    err.into_response()
}

#[cfg(test)]
mod tests {
    use super::{Relayed, relay};
    use crate::api_keys::ApiKey;
    use crate::gateway::openai::stream::StreamWriter;
    use crate::upstream::{UpstreamError, UpstreamEvent};
    use crate::gateway::build_router;
    use crate::gateway::testutil::*;
    use crate::logging::capture::audit_lines;
    use crate::quota::{Bucket, local_day};
    use crate::token_pool::PoolKind;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use sonic_rs::JsonValueTrait;
    use tokio_stream::StreamExt;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CHAT_PATH: &str = "/rest/app-chat/conversations/new";

    fn chat_request(key: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header(header::AUTHORIZATION, format!("Bearer {key}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn ndjson(lines: &[&str]) -> String {
        lines.iter().map(|l| format!("{l}\n")).collect()
    }

    #[tokio::test]
    async fn streaming_chat_retries_429_on_next_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CHAT_PATH))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(CHAT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
                r#"{"result":{"response":{"token":"Hel"}}}"#,
                r#"{"result":{"response":{"token":"lo"}}}"#,
                r#"{"result":{"response":{"modelResponse":{"message":"Hello"}}}}"#,
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let (audit, _guard) = audit_lines();
        let (_dir, state) = state_with_upstream(&server.uri(), "admin").await;
        state
            .tokens
            .add(
                PoolKind::Basic,
                vec!["token-one-aaaaaaaa".to_string(), "token-two-bbbbbbbb".to_string()],
            )
            .await
            .unwrap();

        let resp = build_router(state.clone())
            .oneshot(chat_request(
                "admin",
                r#"{"model":"grok-3","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-accel-buffering").unwrap(), "no");
        assert!(
            resp.headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let text = body_text(resp).await;
        assert!(text.contains("\"content\":\"Hel\""));
        assert!(text.contains("\"content\":\"lo\""));
        assert!(!text.contains("\"content\":\"Hello\""));
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.trim_end().ends_with("data: [DONE]"));

        let a = state.tokens.get("token-one-aaaaaaaa").await.unwrap().unwrap();
        let b = state.tokens.get("token-two-bbbbbbbb").await.unwrap().unwrap();
        assert_eq!(a.failed_count + b.failed_count, 1);
        assert!(a.last_fail_reason.starts_with("429") || b.last_fail_reason.starts_with("429"));

        // 重试过程不产生审计，流结束后恰好一条 200
        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["status"].as_u64(), Some(200));
        assert_eq!(records[0]["model"].as_str(), Some("grok-3"));
        assert_eq!(records[0]["error"].as_str(), Some(""));
    }

    #[tokio::test]
    async fn non_stream_chat_aggregates_reasoning() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CHAT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
                r#"{"result":{"response":{"token":"plan","isThinking":true}}}"#,
                r#"{"result":{"response":{"token":"answer"}}}"#,
            ])))
            .mount(&server)
            .await;

        let (_dir, state) = state_with_upstream(&server.uri(), "admin").await;
        state
            .tokens
            .add(PoolKind::Basic, vec!["tok-cccccccccccc".to_string()])
            .await
            .unwrap();

        let resp = build_router(state)
            .oneshot(chat_request(
                "admin",
                r#"{"model":"grok-4-thinking","messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["object"].as_str(), Some("chat.completion"));
        assert_eq!(v["choices"][0]["message"]["content"].as_str(), Some("answer"));
        assert_eq!(v["choices"][0]["message"]["reasoning_content"].as_str(), Some("plan"));
    }

    #[tokio::test]
    async fn second_chat_over_daily_limit_is_429() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CHAT_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(ndjson(&[r#"{"result":{"response":{"token":"ok"}}}"#])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (audit, _guard) = audit_lines();
        let (_dir, state) = state_with_upstream(&server.uri(), "admin").await;
        state
            .tokens
            .add(PoolKind::Basic, vec!["tok-dddddddddddd".to_string()])
            .await
            .unwrap();
        let mut key = ApiKey::unlimited("sk-limited", "limited");
        key.chat_limit = 1;
        state.keys.upsert(key).await.unwrap();

        let body = r#"{"model":"grok-3","messages":[{"role":"user","content":"hi"}]}"#;
        let app = build_router(state.clone());
        let first = app.clone().oneshot(chat_request("sk-limited", body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(chat_request("sk-limited", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let v = body_json(second).await;
        assert_eq!(v["error"]["code"].as_str(), Some("daily_quota_exceeded"));
        assert!(v["error"]["message"].as_str().unwrap().contains("chat"));

        let day = local_day(crate::db::now_ms(), state.cfg.tz_offset_minutes);
        let usage = state.ledger.usage("sk-limited", &day).await.unwrap();
        assert_eq!(usage.get(Bucket::Chat), 1);

        assert_eq!(audit.statuses(), vec![200, 429]);
        let records = audit.records();
        assert_eq!(records[1]["key_name"].as_str(), Some("limited"));
    }

    #[tokio::test]
    async fn heavy_is_rejected_without_touching_chat() {
        let (_dir, state) = state_with_upstream("http://127.0.0.1:1", "admin").await;
        let mut key = ApiKey::unlimited("sk-heavy", "heavy");
        key.chat_limit = 5;
        key.heavy_limit = 0;
        state.keys.upsert(key).await.unwrap();

        let resp = build_router(state.clone())
            .oneshot(chat_request(
                "sk-heavy",
                r#"{"model":"grok-4-heavy","messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let v = body_json(resp).await;
        assert!(v["error"]["message"].as_str().unwrap().contains("heavy/chat"));

        let day = local_day(crate::db::now_ms(), state.cfg.tz_offset_minutes);
        let usage = state.ledger.usage("sk-heavy", &day).await.unwrap();
        assert_eq!(usage.get(Bucket::Chat), 0);
    }

    #[tokio::test]
    async fn unknown_model_and_no_credential() {
        let (_dir, state) = state_with_upstream("http://127.0.0.1:1", "admin").await;
        let app = build_router(state);

        let resp = app
            .clone()
            .oneshot(chat_request(
                "admin",
                r#"{"model":"gpt-9","messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"]["code"].as_str(), Some("model_not_found"));

        let resp = app
            .oneshot(chat_request(
                "admin",
                r#"{"model":"grok-3","messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn models_endpoints() {
        let (_dir, state) = state_with_upstream("http://127.0.0.1:1", "admin").await;
        let app = build_router(state);
        let get = |uri: &str| {
            Request::builder()
                .uri(uri)
                .header(header::AUTHORIZATION, "Bearer admin")
                .body(Body::empty())
                .unwrap()
        };

        let resp = app.clone().oneshot(get("/v1/models")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["object"].as_str(), Some("list"));

        let resp = app.clone().oneshot(get("/v1/models/grok-4")).await.unwrap();
        assert_eq!(body_json(resp).await["id"].as_str(), Some("grok-4"));

        let resp = app.oneshot(get("/v1/models/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn relay_stops_reading_when_client_leaves() {
        let (_dir, state) = state_with_upstream("http://127.0.0.1:1", "admin").await;
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        drop(rx);
        // 进度事件不产生输出，之后上游一直不结束
        let upstream = futures::stream::iter(vec![Ok::<_, UpstreamError>(UpstreamEvent::ImageProgress {
            index: 0,
            progress: 10,
        })])
        .chain(futures::stream::pending());
        let mut writer = StreamWriter::new("chatcmpl-test".to_string(), 0, "grok-4".to_string());

        let out = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            relay(&state, "tok", &mut writer, upstream, &tx, false),
        )
        .await
        .expect("relay should return once the client is gone");
        assert!(matches!(out, Relayed::ClientGone));
    }
}
