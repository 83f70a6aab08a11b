use crate::error::AppError;
use sonic_rs::prelude::*;

/// 消息里引用的一份媒体：内联 data URI 或远程地址。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRef {
    Inline { mime: String, base64: String },
    Remote(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedPrompt {
    pub text: String,
    pub media: Vec<MediaRef>,
}

/// 从 OpenAI content 字段中提取纯文本：
/// - string：直接返回
/// - array：抽取 {"type":"text","text":...} 并按 sep 连接
pub fn extract_text_from_content(content: &sonic_rs::Value, sep: &str) -> String {
    if let Some(s) = content.as_str() {
        return s.to_string();
    }
    let Some(arr) = content.as_array() else {
        return String::new();
    };

    let mut parts: Vec<&str> = Vec::new();
    for it in arr.iter() {
        if it.get("type").and_then(|v| v.as_str()) != Some("text") {
            continue;
        }
        let t = it.get("text").and_then(|v| v.as_str()).unwrap_or("");
        if !t.is_empty() {
            parts.push(t);
        }
    }
    parts.join(sep)
}

fn media_url_of(part: &sonic_rs::Value) -> Option<String> {
    let typ = part.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let field = match typ {
        "image_url" | "input_image" => part.get("image_url"),
        "file" => part.get("file").and_then(|f| f.get("file_data").or_else(|| f.get("url"))),
        "input_audio" => part.get("input_audio").and_then(|a| a.get("data")),
        _ => None,
    }?;
    if let Some(s) = field.as_str() {
        return Some(s.to_string());
    }
    field.get("url").and_then(|v| v.as_str()).map(str::to_string)
}

pub fn parse_media_ref(raw: &str) -> Result<MediaRef, AppError> {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix("data:") {
        let (meta, data) = rest
            .split_once(',')
            .ok_or_else(|| AppError::bad_request_code("Invalid data URI", "invalid_media"))?;
        let mime = meta.strip_suffix(";base64").ok_or_else(|| {
            AppError::bad_request_code("Only base64 data URIs are supported", "invalid_media")
        })?;
        let mime = if mime.is_empty() { "application/octet-stream" } else { mime };
        return Ok(MediaRef::Inline {
            mime: mime.to_string(),
            base64: data.to_string(),
        });
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Ok(MediaRef::Remote(raw.to_string()));
    }
    Err(AppError::bad_request_code(
        "Unsupported media reference, expected a data URI or http(s) URL",
        "invalid_media",
    ))
}

/// 把消息列表压成一段上游文本与一组媒体引用。
///
/// 只有一条 user 消息时原样发送；多轮对话按 `role: text` 拼接。
pub fn extract_prompt<T, FRole, FContent>(
    messages: &[T],
    role: FRole,
    content: FContent,
) -> Result<ExtractedPrompt, AppError>
where
    FRole: Fn(&T) -> &str,
    FContent: Fn(&T) -> &sonic_rs::Value,
{
    if messages.is_empty() {
        return Err(AppError::bad_request_code(
            "messages is required",
            "missing_messages",
        ));
    }

    let mut turns: Vec<(String, String)> = Vec::new();
    let mut media = Vec::new();
    for m in messages {
        let c = content(m);
        let text = extract_text_from_content(c, "\n");
        if let Some(arr) = c.as_array() {
            for part in arr.iter() {
                if let Some(url) = media_url_of(part) {
                    media.push(parse_media_ref(&url)?);
                }
            }
        }
        if !text.trim().is_empty() {
            let r = role(m).trim();
            let r = if r.is_empty() { "user" } else { r };
            turns.push((r.to_string(), text));
        }
    }

    let text = match turns.as_slice() {
        [(r, t)] if r == "user" => t.clone(),
        _ => turns
            .iter()
            .map(|(r, t)| format!("{r}: {t}"))
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    if text.trim().is_empty() && media.is_empty() {
        return Err(AppError::bad_request_code("Message content is empty", "empty_message"));
    }
    Ok(ExtractedPrompt { text, media })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(raw: &str) -> Vec<(String, sonic_rs::Value)> {
        let v: sonic_rs::Value = sonic_rs::from_str(raw).unwrap();
        v.as_array()
            .unwrap()
            .iter()
            .map(|m| {
                (
                    m.get("role").and_then(|r| r.as_str()).unwrap_or("").to_string(),
                    m.get("content").cloned().unwrap_or_default(),
                )
            })
            .collect()
    }

    fn run(raw: &str) -> Result<ExtractedPrompt, AppError> {
        let m = msgs(raw);
        extract_prompt(&m, |m| m.0.as_str(), |m| &m.1)
    }

    #[test]
    fn single_user_message_is_sent_verbatim() {
        let p = run(r#"[{"role":"user","content":"hello"}]"#).unwrap();
        assert_eq!(p.text, "hello");
        assert!(p.media.is_empty());
    }

    #[test]
    fn multi_turn_is_role_prefixed() {
        let p = run(
            r#"[{"role":"system","content":"be nice"},{"role":"user","content":[{"type":"text","text":"hi"}]}]"#,
        )
        .unwrap();
        assert_eq!(p.text, "system: be nice\n\nuser: hi");
    }

    #[test]
    fn media_parts_are_collected() {
        let p = run(
            r#"[{"role":"user","content":[{"type":"text","text":"look"},{"type":"image_url","image_url":{"url":"data:image/png;base64,AAAA"}},{"type":"image_url","image_url":"https://x/y.png"}]}]"#,
        )
        .unwrap();
        assert_eq!(
            p.media,
            vec![
                MediaRef::Inline {
                    mime: "image/png".to_string(),
                    base64: "AAAA".to_string()
                },
                MediaRef::Remote("https://x/y.png".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_empty_and_bad_media() {
        assert_eq!(run("[]").unwrap_err().code(), "missing_messages");
        assert_eq!(run(r#"[{"role":"user","content":""}]"#).unwrap_err().code(), "empty_message");
        assert_eq!(parse_media_ref("ftp://x").unwrap_err().code(), "invalid_media");
    }
}
