use super::payload::{ChatPayload, ImaginePayload, PostPayload, UploadPayload};
use super::types::{PostResponse, UploadResponse, UploadedFile, UpstreamError};
use crate::config::Config;
use crate::logging::{self, LogLevel};
use crate::util::id;
use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue, ORIGIN,
    REFERER, USER_AGENT,
};
use serde::Serialize;
use std::time::{Duration, Instant};

const CHAT_PATH: &str = "/rest/app-chat/conversations/new";
const UPLOAD_PATH: &str = "/rest/app-chat/upload-file";
const POST_PATH: &str = "/rest/media/post/create";
const IMAGINE_PATH: &str = "/rest/app-chat/imagine/generate";

#[derive(Debug, Clone)]
pub struct GrokClient {
    http: reqwest::Client,
    base_url: String,
    assets_url: String,
    user_agent: String,
    cf_clearance: String,
    log_level: LogLevel,
}

impl GrokClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: cfg.base_url.clone(),
            assets_url: cfg.assets_url.clone(),
            user_agent: cfg.user_agent.clone(),
            cf_clearance: cfg.cf_clearance.clone(),
            log_level: cfg.log_level(),
        })
    }

    /// 会话凭证以 cookie 形式下发；可选附带 cf_clearance。
    pub fn cookie(&self, token: &str) -> String {
        let mut c = format!("sso-rw={token}; sso={token}");
        if !self.cf_clearance.is_empty() {
            c.push_str("; cf_clearance=");
            c.push_str(&self.cf_clearance);
        }
        c
    }

    pub fn headers(&self, token: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent).unwrap_or(HeaderValue::from_static("grok2api")),
        );
        h.insert(ACCEPT, HeaderValue::from_static("*/*"));
        h.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(v) = HeaderValue::from_str(&self.base_url) {
            h.insert(ORIGIN, v.clone());
            h.insert(REFERER, v);
        }
        h.insert(
            COOKIE,
            HeaderValue::from_str(&self.cookie(token)).unwrap_or(HeaderValue::from_static("")),
        );
        if let Ok(v) = HeaderValue::from_str(&id::statsig_id()) {
            h.insert(HeaderName::from_static("x-statsig-id"), v);
        }
        if let Ok(v) = HeaderValue::from_str(&id::request_id()) {
            h.insert(HeaderName::from_static("x-xai-request-id"), v);
        }
        h
    }

    /// 发起会话；成功时返回尚未读取的响应，由调用方按流消费。
    pub async fn chat_stream(
        &self,
        token: &str,
        payload: &ChatPayload,
    ) -> Result<reqwest::Response, UpstreamError> {
        self.post_stream(CHAT_PATH, token, payload).await
    }

    /// 新图片通道（生成与编辑共用）。
    pub async fn imagine_stream(
        &self,
        token: &str,
        payload: &ImaginePayload,
    ) -> Result<reqwest::Response, UpstreamError> {
        self.post_stream(IMAGINE_PATH, token, payload).await
    }

    pub async fn upload_file(
        &self,
        token: &str,
        file_name: &str,
        mime: &str,
        base64_content: &str,
    ) -> Result<UploadedFile, UpstreamError> {
        let payload = UploadPayload {
            file_name,
            file_mime_type: mime,
            content: base64_content,
        };
        let bytes = self.post_json(UPLOAD_PATH, token, &payload).await?;
        let resp: UploadResponse = sonic_rs::from_slice(&bytes)?;
        Ok(UploadedFile {
            file_metadata_id: resp.file_metadata_id,
            file_uri: resp.file_uri,
        })
    }

    /// 创建媒体 post，返回 post id（视频生成的上下文）。
    pub async fn create_post(&self, token: &str, payload: &PostPayload) -> Result<String, UpstreamError> {
        let bytes = self.post_json(POST_PATH, token, payload).await?;
        let resp: PostResponse = sonic_rs::from_slice(&bytes)?;
        match resp.post {
            Some(p) if !p.id.is_empty() => Ok(p.id),
            _ => Err(UpstreamError::Stream("post id missing in response".to_string())),
        }
    }

    /// 拉取资源字节；返回 (bytes, content-type)。
    pub async fn fetch_asset(&self, token: &str, path_or_url: &str) -> Result<(Vec<u8>, String), UpstreamError> {
        let url = self.asset_url(path_or_url);
        let mut headers = self.headers(token);
        headers.remove(CONTENT_TYPE);
        let start = Instant::now();
        if self.log_level.backend_enabled() {
            logging::backend_request("GET", &url, &headers, &[]);
        }

        let resp = self.http.get(url).headers(headers).send().await?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp.bytes().await?;
        if self.log_level.backend_enabled() {
            logging::backend_response(status.as_u16(), start.elapsed(), &[]);
        }
        if !status.is_success() {
            return Err(UpstreamError::http(status.as_u16(), &bytes));
        }
        Ok((bytes.to_vec(), content_type))
    }

    /// 下载调用方消息里引用的远程媒体（不带会话 cookie）。
    pub async fn download(&self, url: &str) -> Result<(Vec<u8>, String), UpstreamError> {
        let resp = self
            .http
            .get(url)
            .header(USER_AGENT, self.user_agent.as_str())
            .send()
            .await?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(UpstreamError::http(status.as_u16(), &bytes));
        }
        Ok((bytes.to_vec(), content_type))
    }

    pub fn asset_url(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            return path_or_url.to_string();
        }
        format!("{}/{}", self.assets_url, path_or_url.trim_start_matches('/'))
    }

    async fn post_stream<T: Serialize>(
        &self,
        path: &str,
        token: &str,
        payload: &T,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = format!("{}{}", self.base_url, path);
        let body = sonic_rs::to_vec(payload)?;
        let headers = self.headers(token);
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", &url, &headers, &body);
        }

        let start = Instant::now();
        let resp = self.http.post(url).headers(headers).body(body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let bytes = resp.bytes().await?;
            if self.log_level.backend_enabled() {
                logging::backend_response(status, start.elapsed(), &bytes);
            }
            return Err(UpstreamError::http(status, &bytes));
        }
        Ok(resp)
    }

    async fn post_json<T: Serialize>(
        &self,
        path: &str,
        token: &str,
        payload: &T,
    ) -> Result<Vec<u8>, UpstreamError> {
        let url = format!("{}{}", self.base_url, path);
        let body = sonic_rs::to_vec(payload)?;
        let headers = self.headers(token);
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", &url, &headers, &body);
        }

        let start = Instant::now();
        let resp = self.http.post(url).headers(headers).body(body).send().await?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;
        if self.log_level.backend_enabled() {
            logging::backend_response(status, start.elapsed(), &bytes);
        }
        if !(200..300).contains(&status) {
            return Err(UpstreamError::http(status, &bytes));
        }
        Ok(bytes.to_vec())
    }
}
