use axum::http::HeaderMap;
use sonic_rs::prelude::*;
use std::borrow::Cow;
use std::time::{Duration, Instant};

/// 详细日志等级：
/// - off：只保留审计行
/// - low：输出客户端请求/响应（格式化/脱敏）
/// - medium：额外输出上游请求/响应（格式化/脱敏）
/// - high：客户端与上游均输出原始内容，上游流逐行打印
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

/// 凭证脱敏：只保留末 8 位。
pub fn token_suffix(token: &str) -> String {
    let n = token.chars().count();
    if n <= 8 {
        return "***".to_string();
    }
    let tail: String = token.chars().skip(n - 8).collect();
    format!("...{tail}")
}

/// 一次入站请求的审计记录；每个请求恰好输出一次。
#[derive(Debug)]
pub struct AuditGuard {
    ip: String,
    model: String,
    key_name: String,
    token_suffix: String,
    started_at: Instant,
    done: bool,
}

impl AuditGuard {
    pub fn new(ip: impl Into<String>, model: impl Into<String>, key_name: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            model: model.into(),
            key_name: key_name.into(),
            token_suffix: String::new(),
            started_at: Instant::now(),
            done: false,
        }
    }

    pub fn set_token(&mut self, token: &str) {
        self.token_suffix = token_suffix(token);
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn success(self, status: u16) {
        self.finish(status, "");
    }

    pub fn failure(self, status: u16, error: &str) {
        self.finish(status, error);
    }

    fn finish(mut self, status: u16, error: &str) {
        self.emit(status, error);
    }

    fn emit(&mut self, status: u16, error: &str) {
        if self.done {
            return;
        }
        self.done = true;
        tracing::info!(
            target: "grok2api::audit",
            ip = %self.ip,
            model = %self.model,
            duration_ms = format_duration_ms(self.started_at.elapsed()),
            status,
            key_name = %self.key_name,
            token_suffix = %self.token_suffix,
            error = %error,
            "请求完成"
        );
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        // 未显式结束（例如客户端中途断开、任务被取消）：按 499 记一次。
        if !self.done {
            self.emit(499, "request aborted");
        }
    }
}

pub fn client_request(method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n{}\n=========================================================",
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn client_request_raw(method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n================== 客户端请求（RAW） ==================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n[客户端请求体]\n{}\n=========================================================",
        format_headers_raw(headers),
        String::from_utf8_lossy(body),
    );
}

pub fn client_response(status: u16, duration: Duration, body: Option<&sonic_rs::Value>) {
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        body.map(format_body_value).unwrap_or_default()
    );
}

pub fn client_stream_response(status: u16, duration: Duration, text: &str, reasoning: &str) {
    tracing::info!(
        "\n=================== 客户端流式响应 =======================\n[客户端流式] {} {}ms\n[reasoning]\n{}\n[content]\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        truncate_text_for_log(reasoning),
        truncate_text_for_log(&truncate_base64_maybe(text, false)),
    );
}

pub fn client_stream_event_raw(event_name: Option<&str>, data: &str) {
    match event_name {
        Some(name) => tracing::info!("event: {}\ndata: {}\n", name, data),
        None => tracing::info!("data: {}\n", data),
    }
}

pub fn backend_request(method: &str, url: &str, headers: &reqwest::header::HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n====================== 上游请求 ========================\n[上游请求] {method} {url}\n[上游请求头]\n{}\n{}\n==========================================================",
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn backend_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n====================== 上游响应 ========================\n[上游响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

pub fn backend_stream_line_raw(line: &[u8]) {
    tracing::info!("{}", String::from_utf8_lossy(line));
}

fn is_secret_header(name: &str) -> bool {
    matches!(
        name,
        "authorization" | "proxy-authorization" | "x-api-key" | "cookie" | "set-cookie"
    )
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut obj = sonic_rs::Object::new();

    for (name, value) in headers.iter() {
        let key = name.as_str();
        let v = if is_secret_header(key) {
            sonic_rs::Value::from("***")
        } else {
            match value.to_str() {
                Ok(s) => sonic_rs::Value::from(s),
                Err(_) => sonic_rs::Value::from("<binary>"),
            }
        };

        // 同名多值统一用数组输出。
        if let Some(existing) = obj.get(&key).and_then(|v| v.as_array()) {
            let mut arr = existing.to_vec();
            arr.push(v);
            obj.insert(key, arr);
        } else {
            obj.insert(key, vec![v]);
        }
    }

    format_body_value(&obj.into_value())
}

fn format_headers_raw(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or("<non-utf8>"));
        out.push('\n');
    }
    out
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    let sanitized = sanitize_json_for_log(v);
    match sonic_rs::to_string_pretty(&sanitized) {
        Ok(s) => s,
        Err(_) => sanitized.to_string(),
    }
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    // 超大请求体（图片上传）只打印头尾，避免日志本身占满内存。
    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    const HEAD_TAIL: usize = 16 * 1024;

    if bytes.len() > MAX_PARSE_BYTES {
        let head = &bytes[..HEAD_TAIL.min(bytes.len())];
        let tail = &bytes[bytes.len().saturating_sub(HEAD_TAIL)..];
        return format!(
            "(body too large: {} bytes, showing head/tail)\n--- head ---\n{}\n--- tail ---\n{}",
            bytes.len(),
            truncate_text_for_log(&String::from_utf8_lossy(head)),
            truncate_text_for_log(&String::from_utf8_lossy(tail))
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => format_body_value(&v),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CHARS).collect();
    out.push_str("...[TRUNCATED]");
    out
}

fn sanitize_json_for_log(v: &sonic_rs::Value) -> sonic_rs::Value {
    if let Some(obj) = v.as_object() {
        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            let sanitized = match key {
                // 上传接口与 b64_json 响应里的原始图片数据
                "content" | "b64_json" | "base64" if child.as_str().is_some() => {
                    let s = child.as_str().unwrap_or("");
                    sonic_rs::Value::from(truncate_base64_maybe(s, key != "content").as_ref())
                }
                _ => sanitize_json_for_log(child),
            };
            out.insert(key, sanitized);
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        let out: Vec<sonic_rs::Value> = arr.iter().map(sanitize_json_for_log).collect();
        return sonic_rs::Value::from(out);
    }

    if let Some(s) = v.as_str() {
        return sonic_rs::Value::from(truncate_base64_maybe(s, false).as_ref());
    }

    v.to_owned()
}

fn truncate_base64_maybe(s: &str, force: bool) -> Cow<'_, str> {
    const KEEP: usize = 20;
    if s.len() <= 100 {
        return Cow::Borrowed(s);
    }

    if let Some(idx) = s.find(";base64,") {
        let prefix_end = idx + ";base64,".len();
        let rest = &s[prefix_end..];
        let (data, suffix) = match rest.find(')') {
            Some(end) => (&rest[..end], &rest[end..]),
            None => (rest, ""),
        };
        if data.len() <= 100 || !data.is_ascii() {
            return Cow::Borrowed(s);
        }
        let omitted = data.len() - KEEP * 2;
        return Cow::Owned(format!(
            "{}{}...[TRUNCATED: {omitted} chars]...{}{}",
            &s[..prefix_end],
            &data[..KEEP],
            &data[data.len() - KEEP..],
            suffix
        ));
    }

    let looks_base64 = force
        || (s.len() > 200
            && s.bytes()
                .take(100)
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=')));
    if !looks_base64 || !s.is_ascii() {
        return Cow::Borrowed(s);
    }

    let omitted = s.len() - KEEP * 2;
    Cow::Owned(format!(
        "{}...[TRUNCATED: {omitted} chars]...{}",
        &s[..KEEP],
        &s[s.len() - KEEP..]
    ))
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::capture::audit_lines;
    use sonic_rs::JsonValueTrait;

    #[test]
    fn token_suffix_masks() {
        assert_eq!(token_suffix("short"), "***");
        assert_eq!(token_suffix("abcdefghijklmnop"), "...ijklmnop");
    }

    #[test]
    fn log_level_parse() {
        assert_eq!(LogLevel::parse("HIGH"), LogLevel::High);
        assert_eq!(LogLevel::parse("backend"), LogLevel::Medium);
        assert_eq!(LogLevel::parse("nope"), LogLevel::Off);
        assert!(LogLevel::Medium.client_enabled());
        assert!(!LogLevel::Low.backend_enabled());
    }

    #[test]
    fn data_uri_is_truncated() {
        let data = "A".repeat(500);
        let s = format!("![image](data:image/png;base64,{data})");
        let out = truncate_base64_maybe(&s, false);
        assert!(out.contains("[TRUNCATED: 460 chars]"));
        assert!(out.ends_with(')'));
    }

    #[test]
    fn secret_headers_redacted() {
        let mut h = HeaderMap::new();
        h.insert("cookie", "sso=secret".parse().unwrap());
        h.insert("accept", "*/*".parse().unwrap());
        let out = format_headers(&h);
        assert!(!out.contains("secret"));
        assert!(out.contains("*/*"));
    }

    #[test]
    fn audit_emits_once_on_finish() {
        let (lines, _guard) = audit_lines();
        let mut audit = AuditGuard::new("1.2.3.4", "grok-3", "k");
        audit.set_token("token-abcdefghijkl");
        audit.success(200);

        let records = lines.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["status"].as_u64(), Some(200));
        assert_eq!(records[0]["token_suffix"].as_str(), Some("...efghijkl"));
        assert_eq!(records[0]["error"].as_str(), Some(""));
    }

    #[test]
    fn audit_drop_counts_as_aborted() {
        let (lines, _guard) = audit_lines();
        drop(AuditGuard::new("1.2.3.4", "grok-3", "k"));
        assert_eq!(lines.statuses(), vec![499]);
    }
}
