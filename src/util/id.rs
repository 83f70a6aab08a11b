use base64::Engine;
use uuid::Uuid;

/// 上游请求头 x-xai-request-id。
pub fn request_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn chat_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

/// 网关缓存中的上传文件名：`upload-<hex>.<ext>`。
pub fn upload_name(ext: &str) -> String {
    format!("upload-{}.{ext}", Uuid::new_v4().simple())
}

/// 上游要求的 x-statsig-id：随机 70 字节的 base64。
pub fn statsig_id() -> String {
    let mut bytes = Vec::with_capacity(80);
    while bytes.len() < 70 {
        bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    }
    bytes.truncate(70);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
