//! 上游请求体。字段名与 Grok Web 端保持一致（camelCase）。

use serde::Serialize;
use sonic_rs::json;

/// `/rest/app-chat/conversations/new` 请求体。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub temporary: bool,
    pub model_name: String,
    pub message: String,
    pub file_attachments: Vec<String>,
    pub image_attachments: Vec<String>,
    pub disable_search: bool,
    pub enable_image_generation: bool,
    pub return_image_bytes: bool,
    pub enable_image_streaming: bool,
    pub image_generation_count: u32,
    pub tool_overrides: sonic_rs::Value,
    pub enable_side_by_side: bool,
    pub send_final_metadata: bool,
    pub is_reasoning: bool,
    pub disable_text_follow_ups: bool,
    pub response_metadata: sonic_rs::Value,
    pub disable_memory: bool,
    pub force_side_by_side: bool,
    pub model_mode: String,
    pub is_async_chat: bool,
}

impl ChatPayload {
    pub fn new(model_name: &str, model_mode: &str, message: impl Into<String>) -> Self {
        Self {
            temporary: true,
            model_name: model_name.to_string(),
            message: message.into(),
            file_attachments: Vec::new(),
            image_attachments: Vec::new(),
            disable_search: false,
            enable_image_generation: true,
            return_image_bytes: false,
            enable_image_streaming: true,
            image_generation_count: 2,
            tool_overrides: json!({}),
            enable_side_by_side: true,
            send_final_metadata: true,
            is_reasoning: false,
            disable_text_follow_ups: true,
            response_metadata: json!({ "requestModelDetails": { "modelId": model_name } }),
            disable_memory: true,
            force_side_by_side: false,
            model_mode: model_mode.to_string(),
            is_async_chat: false,
        }
    }

    pub fn with_attachments(mut self, file_ids: Vec<String>) -> Self {
        self.file_attachments = file_ids;
        self
    }

    /// 视频生成：固定走 grok-3 + videoGen 工具，参数塞进 modelConfigOverride。
    pub fn video(prompt: &str, post_id: &str, cfg: &VideoParams) -> Self {
        let message = format!("{} --mode={}", prompt.trim(), cfg.preset);
        let mut p = Self::new("grok-3", "MODEL_MODE_FAST", message);
        p.enable_image_generation = false;
        p.tool_overrides = json!({ "videoGen": true });
        p.response_metadata = json!({
            "modelConfigOverride": {
                "modelMap": {
                    "videoGenModelConfig": {
                        "parentPostId": post_id,
                        "aspectRatio": cfg.aspect_ratio,
                        "videoLength": cfg.video_length,
                        "videoResolution": cfg.resolution,
                    }
                }
            }
        });
        p
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoParams {
    pub aspect_ratio: String,
    pub video_length: u32,
    pub resolution: String,
    pub preset: String,
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            aspect_ratio: "3:2".to_string(),
            video_length: 6,
            resolution: "480p".to_string(),
            preset: "normal".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPayload<'a> {
    pub file_name: &'a str,
    pub file_mime_type: &'a str,
    /// base64，不带 data: 前缀
    pub content: &'a str,
}

/// `/rest/media/post/create`：有媒体时传 mediaUrl，纯文本视频传 prompt。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPayload {
    pub media_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl PostPayload {
    pub fn from_media(url: String) -> Self {
        Self {
            media_type: "MEDIA_POST_TYPE_IMAGE",
            media_url: Some(url),
            prompt: None,
        }
    }

    pub fn from_prompt(prompt: &str) -> Self {
        Self {
            media_type: "MEDIA_POST_TYPE_VIDEO",
            media_url: None,
            prompt: Some(prompt.to_string()),
        }
    }
}

/// 新图片通道 `/rest/app-chat/imagine/generate` 请求体。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImaginePayload {
    pub prompt: String,
    pub aspect_ratio: String,
    pub image_count: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub image_references: Vec<String>,
    pub enable_nsfw: bool,
}

impl ImaginePayload {
    pub fn generate(prompt: &str, aspect_ratio: &str, count: u32) -> Self {
        Self {
            prompt: prompt.to_string(),
            aspect_ratio: aspect_ratio.to_string(),
            image_count: count.clamp(1, 4),
            image_references: Vec::new(),
            enable_nsfw: false,
        }
    }

    pub fn edit(prompt: &str, file_uris: Vec<String>) -> Self {
        Self {
            image_references: file_uris,
            ..Self::generate(prompt, "2:3", 2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_rs::JsonValueTrait;

    #[test]
    fn chat_payload_uses_camel_case() {
        let p = ChatPayload::new("grok-3", "MODEL_MODE_GROK_3", "hi")
            .with_attachments(vec!["f1".to_string()]);
        let v: sonic_rs::Value = sonic_rs::to_value(&p).unwrap();
        assert_eq!(v["modelName"].as_str(), Some("grok-3"));
        assert_eq!(v["modelMode"].as_str(), Some("MODEL_MODE_GROK_3"));
        assert_eq!(v["fileAttachments"][0].as_str(), Some("f1"));
        assert_eq!(v["imageGenerationCount"].as_u64(), Some(2));
    }

    #[test]
    fn video_payload_carries_post_and_params() {
        let cfg = VideoParams {
            preset: "fun".to_string(),
            ..VideoParams::default()
        };
        let p = ChatPayload::video("a cat", "post-1", &cfg);
        let v: sonic_rs::Value = sonic_rs::to_value(&p).unwrap();
        assert_eq!(v["message"].as_str(), Some("a cat --mode=fun"));
        assert_eq!(v["toolOverrides"]["videoGen"].as_bool(), Some(true));
        let vc = &v["responseMetadata"]["modelConfigOverride"]["modelMap"]["videoGenModelConfig"];
        assert_eq!(vc["parentPostId"].as_str(), Some("post-1"));
        assert_eq!(vc["aspectRatio"].as_str(), Some("3:2"));
        assert_eq!(vc["videoLength"].as_u64(), Some(6));
    }

    #[test]
    fn post_payload_skips_missing_fields() {
        let s = sonic_rs::to_string(&PostPayload::from_prompt("x")).unwrap();
        assert!(!s.contains("mediaUrl"));
        assert!(s.contains("\"prompt\":\"x\""));
    }

    #[test]
    fn imagine_count_is_capped_at_four() {
        assert_eq!(ImaginePayload::generate("p", "1:1", 9).image_count, 4);
        assert_eq!(ImaginePayload::generate("p", "1:1", 0).image_count, 1);
    }
}
