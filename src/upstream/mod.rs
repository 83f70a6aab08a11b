//! Grok Web 上游：HTTP 客户端、请求体构造与 NDJSON 流解析。

pub mod client;
pub mod payload;
pub mod stream;
pub mod types;

pub use client::GrokClient;
pub use types::{UpstreamError, UpstreamEvent, UploadedFile};
