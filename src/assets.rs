//! 网关自托管的限时资源：生成图片与 `/uploads/image` 上传的文件。
//!
//! URL 模式返回 `/v1/files/image/{name}`，字节按 TTL 留在进程内缓存里。

use crate::error::AppError;
use crate::upstream::GrokClient;
use crate::util::id;
use axum::body::Bytes;
use base64::Engine;
use moka::future::Cache;
use std::time::Duration;

/// 缓存总字节上限。
const MAX_CACHE_BYTES: u64 = 1024 * 1024 * 1024;

pub const FILES_ROUTE_PREFIX: &str = "/v1/files/image";

/// 图片占位：取不到结果时对外返回的值。
pub const ERROR_PLACEHOLDER: &str = "error";

#[derive(Debug, Clone)]
pub struct CachedAsset {
    pub bytes: Bytes,
    pub content_type: String,
}

/// 对外返回图片的形式；后两种是同一份 base64 的不同字段名。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetFormat {
    Url,
    Base64,
    B64Json,
}

impl AssetFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "url" => Some(Self::Url),
            "base64" => Some(Self::Base64),
            "b64_json" => Some(Self::B64Json),
            _ => None,
        }
    }

    /// 响应里承载图片的字段名。
    pub fn field(self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::Base64 => "base64",
            Self::B64Json => "b64_json",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AssetStore {
    cache: Cache<String, CachedAsset>,
    public_base: String,
}

impl AssetStore {
    pub fn new(ttl: Duration, app_url: &str) -> Self {
        let cache = Cache::builder()
            .max_capacity(MAX_CACHE_BYTES)
            .weigher(|_k: &String, v: &CachedAsset| u32::try_from(v.bytes.len()).unwrap_or(u32::MAX))
            .time_to_live(ttl)
            .build();
        Self {
            cache,
            public_base: app_url.trim().trim_end_matches('/').to_string(),
        }
    }

    /// 存入一份字节，返回文件名。
    pub async fn put(&self, bytes: Bytes, content_type: &str) -> String {
        let name = id::upload_name(extension_for(content_type));
        self.cache
            .insert(
                name.clone(),
                CachedAsset {
                    bytes,
                    content_type: content_type.to_string(),
                },
            )
            .await;
        name
    }

    pub async fn get(&self, name: &str) -> Option<CachedAsset> {
        self.cache.get(name).await
    }

    /// 未配置 APP_URL 时返回相对路径。
    pub fn public_url(&self, name: &str) -> String {
        format!("{}{FILES_ROUTE_PREFIX}/{name}", self.public_base)
    }

    /// 把一个上游原始资源地址转换为对外值。
    pub async fn convert(
        &self,
        client: &GrokClient,
        token: &str,
        raw: &str,
        format: AssetFormat,
    ) -> Result<String, AppError> {
        let (bytes, content_type) = client
            .fetch_asset(token, raw)
            .await
            .map_err(|e| AppError::upstream(format!("Failed to fetch asset: {}", e.message())))?;
        match format {
            AssetFormat::Url => {
                let name = self.put(Bytes::from(bytes), &content_type).await;
                Ok(self.public_url(&name))
            }
            AssetFormat::Base64 | AssetFormat::B64Json => {
                Ok(base64::engine::general_purpose::STANDARD.encode(&bytes))
            }
        }
    }

    /// 批量转换；单张失败记为占位值而不是让整批失败，占位值原样保留。
    pub async fn convert_all(
        &self,
        client: &GrokClient,
        token: &str,
        raws: &[String],
        format: AssetFormat,
    ) -> Vec<String> {
        let mut out = Vec::with_capacity(raws.len());
        for raw in raws {
            if raw.is_empty() || raw == ERROR_PLACEHOLDER {
                out.push(ERROR_PLACEHOLDER.to_string());
                continue;
            }
            match self.convert(client, token, raw, format).await {
                Ok(v) => out.push(v),
                Err(e) => {
                    tracing::warn!("资源转换失败: {}", e.log_message());
                    out.push(ERROR_PLACEHOLDER.to_string());
                }
            }
        }
        out
    }
}

pub fn extension_for(content_type: &str) -> &'static str {
    let ct = content_type.split(';').next().unwrap_or("").trim().to_lowercase();
    match ct.as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        _ => "bin",
    }
}

/// 按文件名后缀推断类型（`/files/image/{name}` 未命中 content-type 时使用）。
pub fn content_type_for(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}
