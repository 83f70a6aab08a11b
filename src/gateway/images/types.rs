use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `POST /v1/images/generations` 请求体。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageGenerationRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub n: Option<i64>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
    /// 多次调用时的并发上限，1..=3
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InputTokensDetails {
    pub text_tokens: u32,
    pub image_tokens: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImageUsage {
    pub total_tokens: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub input_tokens_details: InputTokensDetails,
}

impl ImageUsage {
    /// 流式完成事件携带的固定计数。
    pub fn per_image() -> Self {
        Self {
            total_tokens: 50,
            input_tokens: 25,
            output_tokens: 25,
            input_tokens_details: InputTokensDetails {
                text_tokens: 5,
                image_tokens: 20,
            },
        }
    }
}

/// 单张图片；键名随 response_format 变化（url / b64_json / base64）。
pub type ImageDatum = BTreeMap<&'static str, String>;

#[derive(Debug, Clone, Serialize)]
pub struct ImagesResponse {
    pub created: i64,
    pub data: Vec<ImageDatum>,
    pub usage: ImageUsage,
}

/// 流式事件 data：partial_image 带 progress，completed 带 usage。
#[derive(Debug, Clone, Serialize)]
pub struct ImageStreamEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub image: ImageDatum,
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ImageUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageMethodResponse {
    pub image_generation_method: String,
}

pub const PARTIAL_IMAGE_EVENT: &str = "image_generation.partial_image";
pub const COMPLETED_EVENT: &str = "image_generation.completed";

impl ImageStreamEvent {
    pub fn partial(field: &'static str, index: usize, progress: u32) -> Self {
        Self {
            kind: PARTIAL_IMAGE_EVENT,
            image: BTreeMap::from([(field, String::new())]),
            index,
            progress: Some(progress),
            usage: None,
        }
    }

    pub fn completed(field: &'static str, value: String, index: usize, usage: ImageUsage) -> Self {
        Self {
            kind: COMPLETED_EVENT,
            image: BTreeMap::from([(field, value)]),
            index,
            progress: None,
            usage: Some(usage),
        }
    }
}
