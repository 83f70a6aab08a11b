//! NDJSON 流解析：字节流 → 行 → 事件。
//!
//! 整条链路是惰性的 pull 流；下游丢弃 Stream 即丢弃底层 `reqwest::Response`，连接随之释放。

use super::types::{StreamLine, StreamResponse, UpstreamError, UpstreamEvent};
use crate::logging;
use async_stream::try_stream;
use futures::Stream;
use sonic_rs::JsonValueTrait;
use tokio_stream::StreamExt;

/// 按 `\n` 切行；跨 chunk 的半行留在缓冲区里，流结束时冲刷残留。
pub fn lines<S, B>(body: S) -> impl Stream<Item = Result<Vec<u8>, UpstreamError>> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send,
    B: AsRef<[u8]> + Send,
{
    try_stream! {
        futures::pin_mut!(body);
        let mut buf: Vec<u8> = Vec::with_capacity(4 * 1024);
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(chunk.as_ref());

            while let Some(nl) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=nl).collect();
                let line = trim_line(&line);
                if !line.is_empty() {
                    yield line.to_vec();
                }
            }
        }

        let rest = trim_line(&buf);
        if !rest.is_empty() {
            yield rest.to_vec();
        }
    }
}

/// 上游事件流；`error` 行以 `UpstreamError::Stream` 结束流。
pub fn events<S, B>(body: S, log_raw: bool) -> impl Stream<Item = Result<UpstreamEvent, UpstreamError>> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send,
    B: AsRef<[u8]> + Send,
{
    try_stream! {
        let lines = lines(body);
        futures::pin_mut!(lines);
        while let Some(line) = lines.next().await {
            let line = line?;
            if log_raw {
                logging::backend_stream_line_raw(&line);
            }
            for ev in parse_line(&line)? {
                yield ev;
            }
        }
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &line[start..end.max(start)]
}

/// 解析一行；无法识别的行返回空列表而不是报错。
pub fn parse_line(line: &[u8]) -> Result<Vec<UpstreamEvent>, UpstreamError> {
    let line = trim_line(line);
    let line = line.strip_prefix(b"data:").map(trim_line).unwrap_or(line);
    if line.is_empty() || line == b"[DONE]" {
        return Ok(Vec::new());
    }

    let parsed = match sonic_rs::from_slice::<StreamLine>(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("跳过无法解析的上游行: {e}");
            return Ok(Vec::new());
        }
    };

    if let Some(err) = parsed.error {
        return Err(UpstreamError::Stream(error_message(&err)));
    }

    let Some(result) = parsed.result else {
        return Ok(Vec::new());
    };
    let resp = result.response.unwrap_or(result.direct);
    Ok(response_events(resp))
}

fn error_message(err: &sonic_rs::Value) -> String {
    if let Some(s) = err.as_str() {
        return s.to_string();
    }
    if let Some(msg) = err.get("message").and_then(|v| v.as_str()) {
        return msg.to_string();
    }
    sonic_rs::to_string(err).unwrap_or_else(|_| "unknown upstream error".to_string())
}

fn clamp_progress(p: f64) -> u32 {
    if p.is_finite() { p.clamp(0.0, 100.0) as u32 } else { 0 }
}

fn response_events(resp: StreamResponse) -> Vec<UpstreamEvent> {
    let mut out = Vec::new();

    if let Some(token) = resp.token
        && !token.is_empty()
        && resp.message_tag != "header"
    {
        out.push(UpstreamEvent::Token {
            text: token,
            thinking: resp.is_thinking,
        });
    }

    if let Some(img) = resp.streaming_image_generation_response {
        if img.image_url.is_empty() {
            out.push(UpstreamEvent::ImageProgress {
                index: img.image_index,
                progress: clamp_progress(img.progress),
            });
        } else {
            out.push(UpstreamEvent::ImageDone {
                index: img.image_index,
                url: img.image_url,
            });
        }
    }

    if let Some(video) = resp.streaming_video_generation_response {
        out.push(UpstreamEvent::VideoProgress {
            progress: clamp_progress(video.progress),
            video_url: (!video.video_url.is_empty()).then_some(video.video_url),
        });
    }

    if let Some(mr) = resp.model_response {
        out.push(UpstreamEvent::ModelResponse {
            message: mr.message,
            image_urls: mr.generated_image_urls,
        });
    }

    out
}

/// 非流式请求：把整条流聚合成一次结果。
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Collected {
    pub text: String,
    pub reasoning: String,
    pub image_urls: Vec<String>,
    pub video_url: Option<String>,
}

impl Collected {
    pub fn push(&mut self, ev: UpstreamEvent) {
        match ev {
            UpstreamEvent::Token { text, thinking: true } => self.reasoning.push_str(&text),
            UpstreamEvent::Token { text, thinking: false } => self.text.push_str(&text),
            UpstreamEvent::ImageDone { url, .. } => self.push_image(url),
            UpstreamEvent::VideoProgress {
                video_url: Some(url), ..
            } => self.video_url = Some(url),
            UpstreamEvent::ModelResponse { message, image_urls } => {
                // 逐 token 没拿到正文时以最终消息为准
                if self.text.is_empty() {
                    self.text = message;
                }
                for url in image_urls {
                    self.push_image(url);
                }
            }
            UpstreamEvent::ImageProgress { .. } | UpstreamEvent::VideoProgress { .. } => {}
        }
    }

    fn push_image(&mut self, url: String) {
        if !url.is_empty() && !self.image_urls.contains(&url) {
            self.image_urls.push(url);
        }
    }
}

pub async fn collect<S>(events: S) -> Result<Collected, UpstreamError>
where
    S: Stream<Item = Result<UpstreamEvent, UpstreamError>>,
{
    futures::pin_mut!(events);
    let mut out = Collected::default();
    while let Some(ev) = events.next().await {
        out.push(ev?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: &[&str]) -> impl Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send {
        let items: Vec<Result<Vec<u8>, reqwest::Error>> =
            chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        futures::stream::iter(items)
    }

    #[tokio::test]
    async fn lines_survive_chunk_boundaries() {
        let s = lines(body(&["{\"a\":", "1}\r\n\n{\"b\"", ":2}\n  {\"c\":3}"]));
        let got: Vec<Vec<u8>> = s.map(|r| r.unwrap()).collect().await;
        assert_eq!(
            got,
            vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec(), b"{\"c\":3}".to_vec()]
        );
    }

    #[test]
    fn parses_tokens_and_thinking() {
        let evs = parse_line(br#"{"result":{"response":{"token":"hi","isThinking":true}}}"#).unwrap();
        assert_eq!(
            evs,
            vec![UpstreamEvent::Token {
                text: "hi".to_string(),
                thinking: true
            }]
        );
        assert!(parse_line(b"not json").unwrap().is_empty());
        assert!(parse_line(b"   ").unwrap().is_empty());
    }

    #[test]
    fn parses_model_response_and_progress() {
        let evs = parse_line(
            br#"{"result":{"response":{"modelResponse":{"message":"done","generatedImageUrls":["u/1.png"]}}}}"#,
        )
        .unwrap();
        assert_eq!(
            evs,
            vec![UpstreamEvent::ModelResponse {
                message: "done".to_string(),
                image_urls: vec!["u/1.png".to_string()]
            }]
        );

        let evs = parse_line(
            br#"{"result":{"streamingImageGenerationResponse":{"imageIndex":1,"progress":150}}}"#,
        )
        .unwrap();
        assert_eq!(evs, vec![UpstreamEvent::ImageProgress { index: 1, progress: 100 }]);

        let evs = parse_line(
            br#"{"result":{"response":{"streamingVideoGenerationResponse":{"progress":100,"videoUrl":"v.mp4"}}}}"#,
        )
        .unwrap();
        assert_eq!(
            evs,
            vec![UpstreamEvent::VideoProgress {
                progress: 100,
                video_url: Some("v.mp4".to_string())
            }]
        );
    }

    #[test]
    fn error_line_is_an_error() {
        let err = parse_line(br#"{"error":{"code":7,"message":"Content moderated"}}"#).unwrap_err();
        assert!(err.is_moderation());
        assert!(matches!(err, UpstreamError::Stream(_)));
    }

    #[tokio::test]
    async fn collect_aggregates_stream() {
        let s = events(
            body(&[
                "{\"result\":{\"response\":{\"token\":\"think\",\"isThinking\":true}}}\n",
                "{\"result\":{\"response\":{\"token\":\"Hel\"}}}\n{\"result\":{\"response\":{\"token\":\"lo\"}}}\n",
                "{\"result\":{\"response\":{\"modelResponse\":{\"message\":\"Hello\",\"generatedImageUrls\":[\"a\",\"a\"]}}}}",
            ]),
            false,
        );
        let out = collect(s).await.unwrap();
        assert_eq!(out.text, "Hello");
        assert_eq!(out.reasoning, "think");
        assert_eq!(out.image_urls, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn collect_stops_on_error_line() {
        let s = events(
            body(&["{\"result\":{\"response\":{\"token\":\"x\"}}}\n{\"error\":\"boom\"}\n"]),
            false,
        );
        let err = collect(s).await.unwrap_err();
        assert_eq!(err.message(), "Grok 上游流错误: boom");
    }
}
