use serde::Deserialize;
use thiserror::Error;

/// 上游错误正文在日志与错误消息中保留的最大字符数。
pub const MAX_ERROR_BODY_CHARS: usize = 500;

/// 命中即视为内容审核拦截（小写比较）。
const MODERATION_SIGNATURES: [&str; 6] = [
    "content moderated",
    "content-moderated",
    "content_moderated",
    "blocked by moderation",
    "violates our content policy",
    "moderation_blocked",
];

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Grok 上游错误 {status}: {message}")]
    Http { status: u16, message: String },

    /// 上游在 200 响应体中返回的 error 行
    #[error("Grok 上游流错误: {0}")]
    Stream(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

impl UpstreamError {
    pub fn http(status: u16, body: &[u8]) -> Self {
        Self::Http {
            status,
            message: truncate_body(body),
        }
    }

    /// 用于重试判定与凭证冷却的状态码；网络错误记为 0。
    pub fn status(&self) -> u16 {
        match self {
            Self::Http { status, .. } => *status,
            Self::Stream(_) | Self::Json(_) => 500,
            Self::Transport(e) => e.status().map(|s| s.as_u16()).unwrap_or(0),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Http { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_moderation(&self) -> bool {
        is_moderation_text(&self.message())
    }
}

pub fn is_moderation_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    MODERATION_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

pub fn truncate_body(body: &[u8]) -> String {
    let s = String::from_utf8_lossy(body);
    let s = s.trim();
    if s.chars().count() <= MAX_ERROR_BODY_CHARS {
        return s.to_string();
    }
    s.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

/// 一行 NDJSON 解析出的语义事件。
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Token { text: String, thinking: bool },
    ImageProgress { index: u32, progress: u32 },
    /// 新通道逐张返回的成品图
    ImageDone { index: u32, url: String },
    VideoProgress { progress: u32, video_url: Option<String> },
    /// 会话结束时的完整回答与生成图片列表
    ModelResponse { message: String, image_urls: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub file_metadata_id: String,
    pub file_uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadResponse {
    #[serde(default)]
    pub file_metadata_id: String,
    #[serde(default)]
    pub file_uri: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PostResponse {
    #[serde(default)]
    pub post: Option<PostInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PostInfo {
    #[serde(default)]
    pub id: String,
}

// ===== NDJSON 行结构 =====

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamLine {
    #[serde(default)]
    pub result: Option<StreamResult>,
    #[serde(default)]
    pub error: Option<sonic_rs::Value>,
}

/// 会话接口包在 `result.response` 里，新图片通道直接放在 `result` 下。
#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamResult {
    #[serde(default)]
    pub response: Option<StreamResponse>,
    #[serde(flatten)]
    pub direct: StreamResponse,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StreamResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub is_thinking: bool,
    #[serde(default)]
    pub message_tag: String,
    #[serde(default)]
    pub model_response: Option<ModelResponse>,
    #[serde(default)]
    pub streaming_image_generation_response: Option<ImageGenerationProgress>,
    #[serde(default)]
    pub streaming_video_generation_response: Option<VideoGenerationProgress>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ModelResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub generated_image_urls: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImageGenerationProgress {
    #[serde(default)]
    pub image_index: u32,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub image_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VideoGenerationProgress {
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub video_url: String,
}
