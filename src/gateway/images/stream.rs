//! 流式出图：转发上游进度为 partial_image 事件，结束后按 n 选图并逐张发 completed。

use super::strategy::{self, ImageJob, LEGACY_BATCH, Strategy, dedupe, pick_images};
use super::types::{ImageStreamEvent, ImageUsage};
use crate::assets::{AssetFormat, ERROR_PLACEHOLDER};
use crate::gateway::AppState;
use crate::gateway::common::{record_upstream_failure, upstream_app_error};
use crate::gateway::openai::handler::sse_response;
use crate::gateway::openai::stream::error_event_json;
use crate::logging::{self, AuditGuard};
use crate::upstream::stream::events;
use crate::upstream::{UploadedFile, UpstreamError, UpstreamEvent};
use axum::http::StatusCode;
use axum::response::Response;
use axum::response::sse::Event;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

type Tx = mpsc::Sender<Result<Event, Infallible>>;

/// 上游图片下标 → 对外下标：按首次出现顺序编号，不超过 n-1。
#[derive(Debug)]
pub struct IndexMap {
    last: usize,
    seen: HashMap<u32, usize>,
}

impl IndexMap {
    pub fn new(n: usize) -> Self {
        Self {
            last: n.saturating_sub(1),
            seen: HashMap::new(),
        }
    }

    pub fn map(&mut self, raw: u32) -> usize {
        let next = self.seen.len().min(self.last);
        *self.seen.entry(raw).or_insert(next)
    }
}

/// 一次上游流读完后的结果。
enum Forwarded {
    Images(Vec<String>),
    Failed(UpstreamError),
    ClientGone,
}

fn event(name: &str, data: &ImageStreamEvent, log_raw: bool) -> Event {
    let data = sonic_rs::to_string(data).unwrap_or_default();
    if log_raw {
        logging::client_stream_event_raw(Some(name), &data);
    }
    Event::default().event(name).data(data)
}

/// 客户端断开即停止读取上游，不等下一次发送失败。
async fn forward<S>(
    tx: &Tx,
    stream: S,
    field: &'static str,
    index_map: &mut IndexMap,
    log_raw: bool,
) -> Forwarded
where
    S: futures::Stream<Item = Result<UpstreamEvent, UpstreamError>>,
{
    futures::pin_mut!(stream);

    let mut images = Vec::new();
    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = tx.closed() => return Forwarded::ClientGone,
        };
        let ev = match item {
            Some(Ok(ev)) => ev,
            Some(Err(e)) => return Forwarded::Failed(e),
            None => break,
        };
        match ev {
            UpstreamEvent::ImageProgress { index, progress } => {
                let partial = ImageStreamEvent::partial(field, index_map.map(index), progress);
                if tx.send(Ok(event(partial.kind, &partial, log_raw))).await.is_err() {
                    return Forwarded::ClientGone;
                }
            }
            UpstreamEvent::ImageDone { url, .. } => images.push(url),
            UpstreamEvent::ModelResponse { image_urls, .. } => images.extend(image_urls),
            _ => {}
        }
    }
    Forwarded::Images(images)
}

#[allow(clippy::too_many_arguments)]
pub fn stream_images(
    state: Arc<AppState>,
    opened: Strategy,
    resp: reqwest::Response,
    token: String,
    job: ImageJob,
    refs: Vec<UploadedFile>,
    format: AssetFormat,
    audit: AuditGuard,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(256);

    tokio::spawn(async move {
        let log_raw = state.cfg.log_level().raw_enabled();
        let field = format.field();
        let mut index_map = IndexMap::new(job.n);

        let mut outcome = forward(&tx, events(resp.bytes_stream(), log_raw), field, &mut index_map, log_raw).await;

        // experimental 流失败或零结果：同一凭证改走 legacy
        let needs_fallback = match &outcome {
            Forwarded::Images(v) => dedupe(v.clone()).is_empty(),
            Forwarded::Failed(_) => true,
            Forwarded::ClientGone => false,
        };
        if opened == Strategy::Experimental && needs_fallback {
            if let Forwarded::Failed(e) = &outcome {
                tracing::warn!(status = e.status(), "experimental 流式出图失败，回退 legacy: {}", e.message());
            } else {
                tracing::warn!("experimental 流式出图没有结果，回退 legacy");
            }
            outcome = match strategy::open_call(&state.client, &token, Strategy::Legacy, &job, &refs, LEGACY_BATCH).await {
                Ok(resp) => forward(&tx, events(resp.bytes_stream(), log_raw), field, &mut index_map, log_raw).await,
                Err(e) => Forwarded::Failed(e),
            };
        }

        let images = match outcome {
            Forwarded::ClientGone => {
                audit.failure(499, "client disconnected");
                return;
            }
            Forwarded::Failed(e) => {
                record_upstream_failure(&state.tokens, &token, &e).await;
                let app = upstream_app_error(&e);
                let data = error_event_json(&app.client_message(), app.code());
                let _ = tx.send(Ok(Event::default().event("error").data(data))).await;
                audit.failure(app.status().as_u16(), &app.log_message());
                return;
            }
            Forwarded::Images(images) => dedupe(images),
        };

        if images.is_empty() {
            let done = ImageStreamEvent::completed(field, ERROR_PLACEHOLDER.to_string(), 0, ImageUsage::default());
            let _ = tx.send(Ok(event(done.kind, &done, log_raw))).await;
            tracing::warn!("流式出图没有任何结果");
            audit.success(StatusCode::OK.as_u16());
            return;
        }

        let picked = pick_images(images, job.n);
        let converted = state.assets.convert_all(&state.client, &token, &picked, format).await;
        for (index, value) in converted.into_iter().enumerate() {
            let usage = if value == ERROR_PLACEHOLDER {
                ImageUsage::default()
            } else {
                ImageUsage::per_image()
            };
            let done = ImageStreamEvent::completed(field, value, index, usage);
            if tx.send(Ok(event(done.kind, &done, log_raw))).await.is_err() {
                audit.failure(499, "client disconnected");
                return;
            }
        }
        audit.success(StatusCode::OK.as_u16());
    });

    sse_response(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_rs::JsonValueTrait;

    #[test]
    fn index_map_is_stable_and_bounded() {
        let mut m = IndexMap::new(2);
        assert_eq!(m.map(7), 0);
        assert_eq!(m.map(3), 1);
        assert_eq!(m.map(7), 0);
        assert_eq!(m.map(9), 1);

        let mut one = IndexMap::new(1);
        assert_eq!(one.map(0), 0);
        assert_eq!(one.map(1), 0);
    }

    #[tokio::test]
    async fn forward_stops_reading_when_client_leaves() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        // 只有成品图事件（不触发发送），之后上游一直不结束
        let upstream = futures::stream::iter(vec![Ok::<_, UpstreamError>(UpstreamEvent::ImageDone {
            index: 0,
            url: "/i/1.png".to_string(),
        })])
        .chain(futures::stream::pending());
        let mut index_map = IndexMap::new(1);

        let out = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            forward(&tx, upstream, "url", &mut index_map, false),
        )
        .await
        .expect("forward should return once the client is gone");
        assert!(matches!(out, Forwarded::ClientGone));
    }

    #[tokio::test]
    async fn forward_collects_images_until_upstream_ends() {
        let (tx, mut rx) = mpsc::channel(4);
        let upstream = futures::stream::iter(vec![
            Ok::<_, UpstreamError>(UpstreamEvent::ImageProgress { index: 5, progress: 50 }),
            Ok(UpstreamEvent::ImageDone {
                index: 5,
                url: "/i/1.png".to_string(),
            }),
        ]);
        let mut index_map = IndexMap::new(2);

        let out = forward(&tx, upstream, "url", &mut index_map, false).await;
        assert!(matches!(out, Forwarded::Images(ref v) if v == &vec!["/i/1.png".to_string()]));
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn partial_event_shape() {
        let ev = ImageStreamEvent::partial("b64_json", 1, 40);
        let s = sonic_rs::to_string(&ev).unwrap();
        let v: sonic_rs::Value = sonic_rs::from_str(&s).unwrap();
        assert_eq!(v["type"].as_str(), Some("image_generation.partial_image"));
        assert_eq!(v["b64_json"].as_str(), Some(""));
        assert_eq!(v["index"].as_u64(), Some(1));
        assert_eq!(v["progress"].as_u64(), Some(40));
        assert!(v.get("usage").is_none());
    }
}
