use super::types::{
    AssistantMessage, ChatCompletion, Choice, ModelItem, ModelsResponse, Usage, VideoConfig,
};
use crate::error::AppError;
use crate::upstream::payload::VideoParams;
use crate::upstream::stream::Collected;
use crate::util::model::ModelInfo;
use chrono::Utc;

const ASPECT_RATIOS: [&str; 5] = ["3:2", "2:3", "1:1", "16:9", "9:16"];
const VIDEO_LENGTHS: [u32; 2] = [6, 10];
const RESOLUTIONS: [&str; 2] = ["480p", "720p"];
const PRESETS: [&str; 4] = ["normal", "fun", "spicy", "custom"];

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

pub fn model_item(m: &ModelInfo) -> ModelItem {
    ModelItem {
        id: m.id.to_string(),
        object: "model",
        created: 0,
        owned_by: "grok2api",
        display_name: m.display_name.to_string(),
        description: m.description.to_string(),
    }
}

pub fn to_models_response(models: &[ModelInfo]) -> ModelsResponse {
    ModelsResponse {
        object: "list",
        data: models.iter().map(model_item).collect(),
    }
}

/// 校验 video_config 并补默认值；非法取值返回 400。
pub fn resolve_video_params(cfg: Option<&VideoConfig>) -> Result<VideoParams, AppError> {
    let mut out = VideoParams::default();
    let Some(cfg) = cfg else {
        return Ok(out);
    };

    if let Some(ar) = cfg.aspect_ratio.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        if !ASPECT_RATIOS.contains(&ar) {
            return Err(invalid_video(format!(
                "aspect_ratio must be one of {}",
                ASPECT_RATIOS.join(", ")
            )));
        }
        out.aspect_ratio = ar.to_string();
    }
    if let Some(len) = cfg.video_length {
        if !VIDEO_LENGTHS.contains(&len) {
            return Err(invalid_video("video_length must be 6 or 10".to_string()));
        }
        out.video_length = len;
    }
    if let Some(res) = cfg.resolution_name.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        if !RESOLUTIONS.contains(&res) {
            return Err(invalid_video("resolution_name must be 480p or 720p".to_string()));
        }
        out.resolution = res.to_string();
    }
    if let Some(p) = cfg.preset.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let p = p.to_lowercase();
        if !PRESETS.contains(&p.as_str()) {
            return Err(invalid_video(format!("preset must be one of {}", PRESETS.join(", "))));
        }
        out.preset = p;
    }
    Ok(out)
}

fn invalid_video(message: String) -> AppError {
    AppError::bad_request_code(message, "invalid_video_config")
}

pub fn image_markdown(url: &str) -> String {
    format!("![image]({url})\n")
}

pub fn video_markdown(url: &str) -> String {
    format!("[video]({url})\n")
}

/// 非流式：聚合结果 + 已转换的图片/视频链接 → 一个 chat.completion。
pub fn to_chat_completion(
    id: String,
    model: &str,
    collected: &Collected,
    image_links: &[String],
    video_link: Option<&str>,
) -> ChatCompletion {
    let mut content = collected.text.clone();
    let mut extras = String::new();
    for link in image_links {
        extras.push_str(&image_markdown(link));
    }
    if let Some(link) = video_link {
        extras.push_str(&video_markdown(link));
    }
    if !extras.is_empty() {
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&extras);
    }

    ChatCompletion {
        id,
        object: "chat.completion",
        created: now_unix(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: Some(AssistantMessage {
                role: "assistant",
                content,
                reasoning_content: collected.reasoning.clone(),
            }),
            delta: None,
            finish_reason: Some("stop".to_string()),
        }],
        usage: Some(Usage::default()),
    }
}
