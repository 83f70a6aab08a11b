use super::types::{ChatCompletion, Choice, Delta, Usage};

/// 错误事件的 data：与非流式错误体同形。
pub fn error_event_json(msg: &str, code: &str) -> String {
    serde_json::json!({
        "error": {
            "message": msg,
            "type": "invalid_request_error",
            "code": code,
        }
    })
    .to_string()
}

/// OpenAI SSE: 写入 `{"error":{...}}` 事件并结束。
pub fn sse_error_events(msg: &str, code: &str) -> Vec<String> {
    vec![error_event_json(msg, code), "[DONE]".to_string()]
}

/// 把增量文本写成 chat.completion.chunk；首个 chunk 之前补一次 role。
pub struct StreamWriter {
    id: String,
    created: i64,
    model: String,
    sent_role: bool,

    /// 客户端日志用的累计内容
    text: String,
    reasoning: String,
}

impl StreamWriter {
    pub fn new(id: String, created: i64, model: String) -> Self {
        Self {
            id,
            created,
            model,
            sent_role: false,
            text: String::new(),
            reasoning: String::new(),
        }
    }

    pub fn content(&mut self, s: &str) -> Vec<String> {
        if s.is_empty() {
            return Vec::new();
        }
        self.text.push_str(s);
        let mut out = self.write_role();
        out.extend(self.write_chunk(
            Delta {
                content: s.to_string(),
                ..Delta::default()
            },
            None,
            None,
        ));
        out
    }

    pub fn reasoning(&mut self, s: &str) -> Vec<String> {
        if s.is_empty() {
            return Vec::new();
        }
        self.reasoning.push_str(s);
        let mut out = self.write_role();
        out.extend(self.write_chunk(
            Delta {
                reasoning_content: s.to_string(),
                ..Delta::default()
            },
            None,
            None,
        ));
        out
    }

    pub fn finish_events(&mut self) -> Vec<String> {
        let mut out = self.write_role();
        out.extend(self.write_chunk(Delta::default(), Some("stop"), Some(Usage::default())));
        out.push("[DONE]".to_string());
        out
    }

    pub fn logged_text(&self) -> (&str, &str) {
        (&self.text, &self.reasoning)
    }

    fn write_role(&mut self) -> Vec<String> {
        if self.sent_role {
            return Vec::new();
        }
        self.sent_role = true;
        self.write_chunk(
            Delta {
                role: "assistant".to_string(),
                ..Delta::default()
            },
            None,
            None,
        )
    }

    fn write_chunk(&self, delta: Delta, finish_reason: Option<&str>, usage: Option<Usage>) -> Vec<String> {
        let chunk = ChatCompletion {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: None,
                delta: Some(delta),
                finish_reason: finish_reason.map(str::to_string),
            }],
            usage,
        };
        match sonic_rs::to_string(&chunk) {
            Ok(s) => vec![s],
            Err(_) => Vec::new(),
        }
    }
}
