//! 两条出图通道：
//! - legacy：对话接口，每次调用固定出 2 张
//! - experimental：imagine 接口，每次调用至多 4 张
//!
//! experimental 失败或没有结果时，在同一请求内回退到 legacy。

use crate::assets::ERROR_PLACEHOLDER;
use crate::config::Config;
use crate::upstream::payload::{ChatPayload, ImaginePayload};
use crate::upstream::stream::{collect, events};
use crate::upstream::{GrokClient, UploadedFile, UpstreamError};
use crate::util::concurrency::gather_limited;
use crate::util::model::ModelInfo;
use crate::util::random;

pub const LEGACY_BATCH: usize = 2;
pub const EXPERIMENTAL_BATCH: usize = 4;
pub const MAX_IMAGES: usize = 10;
const DEFAULT_ASPECT_RATIO: &str = "2:3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Legacy,
    Experimental,
}

impl Strategy {
    pub fn preferred(cfg: &Config) -> Self {
        if cfg.prefers_experimental_images() {
            Self::Experimental
        } else {
            Self::Legacy
        }
    }

    pub fn batch(self) -> usize {
        match self {
            Self::Legacy => LEGACY_BATCH,
            Self::Experimental => EXPERIMENTAL_BATCH,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Experimental => "experimental",
        }
    }
}

/// 校验后的出图参数。
#[derive(Debug, Clone)]
pub struct ImageJob {
    pub model: &'static ModelInfo,
    pub prompt: String,
    pub aspect_ratio: String,
    pub n: usize,
    pub concurrency: usize,
    pub edit: bool,
}

impl ImageJob {
    fn legacy_message(&self) -> String {
        if self.edit {
            format!("Image Edit: {}", self.prompt)
        } else {
            format!("Image Generation: {}", self.prompt)
        }
    }
}

/// OpenAI 的 size 或直接给出的比例 → 上游 aspectRatio。
pub fn aspect_ratio(size: Option<&str>) -> &'static str {
    let Some(size) = size.map(str::trim).filter(|s| !s.is_empty()) else {
        return DEFAULT_ASPECT_RATIO;
    };
    match size.to_lowercase().as_str() {
        "16:9" => "16:9",
        "9:16" => "9:16",
        "1:1" => "1:1",
        "2:3" => "2:3",
        "3:2" => "3:2",
        "1024x1024" | "512x512" => "1:1",
        "1024x576" | "1280x720" | "1536x864" => "16:9",
        "576x1024" | "720x1280" | "864x1536" => "9:16",
        "1024x1536" | "512x768" | "768x1024" => "2:3",
        "1536x1024" | "768x512" | "1024x768" => "3:2",
        _ => DEFAULT_ASPECT_RATIO,
    }
}

/// n 拆成每次调用的张数，例如 n=5、batch=4 → [4, 1]。
pub fn batches(n: usize, batch: usize) -> Vec<usize> {
    let batch = batch.max(1);
    let mut out = Vec::new();
    let mut left = n.max(1);
    while left > 0 {
        let take = left.min(batch);
        out.push(take);
        left -= take;
    }
    out
}

/// 去重（保持首次出现顺序），丢弃空串与占位值。
pub fn dedupe(images: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(images.len());
    for img in images {
        if img.is_empty() || img == ERROR_PLACEHOLDER || out.contains(&img) {
            continue;
        }
        out.push(img);
    }
    out
}

/// 结果多于 n 时随机取 n 张；不足时用占位值补齐到 n。
pub fn pick_images(images: Vec<String>, n: usize) -> Vec<String> {
    if images.len() >= n {
        return random::sample(&images, n);
    }
    let mut out = images;
    out.resize(n, ERROR_PLACEHOLDER.to_string());
    out
}

/// 发起单次出图调用，返回尚未读取的 NDJSON 响应。
pub async fn open_call(
    client: &GrokClient,
    token: &str,
    strategy: Strategy,
    job: &ImageJob,
    refs: &[UploadedFile],
    count: usize,
) -> Result<reqwest::Response, UpstreamError> {
    match strategy {
        Strategy::Legacy => {
            let file_ids = refs.iter().map(|f| f.file_metadata_id.clone()).collect();
            let payload = ChatPayload::new(job.model.upstream_model, job.model.upstream_mode, job.legacy_message())
                .with_attachments(file_ids);
            client.chat_stream(token, &payload).await
        }
        Strategy::Experimental => {
            let mut payload = if job.edit {
                ImaginePayload::edit(&job.prompt, refs.iter().map(|f| f.file_uri.clone()).collect())
            } else {
                ImaginePayload::generate(&job.prompt, &job.aspect_ratio, count as u32)
            };
            payload.aspect_ratio = job.aspect_ratio.clone();
            payload.image_count = count.clamp(1, EXPERIMENTAL_BATCH) as u32;
            client.imagine_stream(token, &payload).await
        }
    }
}

/// 按批次并发调用某一通道并汇总去重后的图片地址。
///
/// 单次调用失败只记日志，缺的位置由 `pick_images` 补 "error"；没有任何图片时才报错。
pub async fn run_strategy(
    client: &GrokClient,
    token: &str,
    strategy: Strategy,
    job: &ImageJob,
    refs: &[UploadedFile],
    log_raw: bool,
) -> Result<Vec<String>, UpstreamError> {
    let calls = batches(job.n, strategy.batch());
    let concurrency = job.concurrency.min(calls.len());
    let factories: Vec<_> = calls
        .into_iter()
        .map(|count| {
            move || async move {
                let resp = open_call(client, token, strategy, job, refs, count).await?;
                let collected = collect(events(resp.bytes_stream(), log_raw)).await?;
                Ok::<_, UpstreamError>(collected.image_urls)
            }
        })
        .collect();
    let results = gather_limited(factories, concurrency).await;
    merge_results(strategy, results)
}

fn merge_results(
    strategy: Strategy,
    results: Vec<Result<Vec<String>, UpstreamError>>,
) -> Result<Vec<String>, UpstreamError> {
    let mut images = Vec::new();
    let mut first_err: Option<UpstreamError> = None;
    for r in results {
        match r {
            Ok(urls) => images.extend(urls),
            Err(e) => {
                tracing::warn!(
                    strategy = strategy.as_str(),
                    status = e.status(),
                    "单次出图失败: {}",
                    e.message()
                );
                first_err.get_or_insert(e);
            }
        }
    }
    let images = dedupe(images);
    if images.is_empty()
        && let Some(e) = first_err
    {
        return Err(e);
    }
    Ok(images)
}

/// 首选通道为 experimental 时先试它，失败或零结果再走 legacy。
pub async fn generate_with_fallback(
    client: &GrokClient,
    token: &str,
    preferred: Strategy,
    job: &ImageJob,
    refs: &[UploadedFile],
    log_raw: bool,
) -> Result<Vec<String>, UpstreamError> {
    if preferred == Strategy::Experimental {
        match run_strategy(client, token, Strategy::Experimental, job, refs, log_raw).await {
            Ok(images) if !images.is_empty() => return Ok(images),
            Ok(_) => tracing::warn!("experimental 通道没有返回图片，回退 legacy"),
            Err(e) => tracing::warn!(
                status = e.status(),
                "experimental 通道失败，回退 legacy: {}",
                e.message()
            ),
        }
    }
    run_strategy(client, token, Strategy::Legacy, job, refs, log_raw).await
}

/// 流式出图只发一次调用；experimental 打开失败时直接改用 legacy。
pub async fn open_stream(
    client: &GrokClient,
    token: &str,
    preferred: Strategy,
    job: &ImageJob,
    refs: &[UploadedFile],
) -> Result<(Strategy, reqwest::Response), UpstreamError> {
    if preferred == Strategy::Experimental {
        match open_call(client, token, Strategy::Experimental, job, refs, job.n).await {
            Ok(resp) => return Ok((Strategy::Experimental, resp)),
            Err(e) => tracing::warn!(
                status = e.status(),
                "experimental 流式出图失败，回退 legacy: {}",
                e.message()
            ),
        }
    }
    let resp = open_call(client, token, Strategy::Legacy, job, refs, LEGACY_BATCH).await?;
    Ok((Strategy::Legacy, resp))
}
