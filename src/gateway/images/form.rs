//! multipart 表单读取与图片文件校验（编辑接口、上传接口共用）。

use crate::error::AppError;
use crate::gateway::common::extract::MediaRef;
use axum::body::Bytes;
use axum::extract::Multipart;
use axum::extract::multipart::{Field, MultipartError};
use axum::http::StatusCode;
use base64::Engine;

pub const MAX_EDIT_IMAGES: usize = 16;
pub const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;
const SUPPORTED_MIMES: [&str; 3] = ["image/png", "image/jpeg", "image/webp"];

#[derive(Debug, Clone)]
pub struct FormFile {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct EditForm {
    pub prompt: String,
    pub model: Option<String>,
    pub n: Option<i64>,
    pub size: Option<String>,
    pub response_format: Option<String>,
    pub stream: Option<bool>,
    pub images: Vec<FormFile>,
}

pub fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return AppError::PayloadTooLarge("Request body too large".to_string());
    }
    AppError::bad_request_code(format!("Invalid multipart body: {}", e.body_text()), "invalid_multipart")
}

async fn read_text(field: Field<'_>) -> Result<String, AppError> {
    Ok(field.text().await.map_err(multipart_error)?.trim().to_string())
}

async fn read_file(field: Field<'_>) -> Result<FormFile, AppError> {
    let file_name = field.file_name().unwrap_or("").to_string();
    let content_type = field.content_type().map(str::to_string);
    let bytes = field.bytes().await.map_err(multipart_error)?;
    Ok(FormFile {
        file_name,
        content_type,
        bytes,
    })
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn parse_bool(s: &str) -> bool {
    matches!(s.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

pub async fn read_edit_form(mut mp: Multipart) -> Result<EditForm, AppError> {
    let mut form = EditForm::default();
    while let Some(field) = mp.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "image" | "image[]" => form.images.push(read_file(field).await?),
            "prompt" => form.prompt = read_text(field).await?,
            "model" => form.model = non_empty(read_text(field).await?),
            "size" => form.size = non_empty(read_text(field).await?),
            "response_format" => form.response_format = non_empty(read_text(field).await?),
            "stream" => form.stream = Some(parse_bool(&read_text(field).await?)),
            "n" => {
                let raw = read_text(field).await?;
                if raw.is_empty() {
                    continue;
                }
                let n = raw
                    .parse::<i64>()
                    .map_err(|_| AppError::bad_request_code("n must be an integer", "invalid_n"))?;
                form.n = Some(n);
            }
            // quality / style 等字段不影响上游请求
            _ => {}
        }
    }
    Ok(form)
}

/// 读取名为 `name` 的单个文件字段。
pub async fn read_single_file(mut mp: Multipart, name: &str) -> Result<FormFile, AppError> {
    while let Some(field) = mp.next_field().await.map_err(multipart_error)? {
        if field.name() == Some(name) {
            return read_file(field).await;
        }
    }
    Err(AppError::bad_request_code(
        format!("Missing file field `{name}`"),
        "missing_file",
    ))
}

/// 校验大小与类型，返回规范化后的 MIME。
pub fn validate_image(file: &FormFile) -> Result<&'static str, AppError> {
    if file.bytes.is_empty() {
        return Err(AppError::bad_request_code("File is empty", "empty_file"));
    }
    if file.bytes.len() > MAX_IMAGE_BYTES {
        return Err(AppError::PayloadTooLarge("File size exceeds 50MB limit".to_string()));
    }

    let declared = file
        .content_type
        .as_deref()
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_lowercase())
        .unwrap_or_default();
    let declared = if declared == "image/jpg" { "image/jpeg".to_string() } else { declared };
    if let Some(mime) = SUPPORTED_MIMES.iter().find(|m| **m == declared) {
        return Ok(*mime);
    }

    let ext = file
        .file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => Ok("image/jpeg"),
        "png" => Ok("image/png"),
        "webp" => Ok("image/webp"),
        _ => Err(AppError::bad_request_code(
            "Unsupported image type. Supported: png, jpg, webp.",
            "invalid_image_type",
        )),
    }
}

/// 编辑接口的全部输入图片：数量、大小、类型都在上传前校验。
pub fn validate_edit_images(files: &[FormFile]) -> Result<Vec<MediaRef>, AppError> {
    if files.is_empty() {
        return Err(AppError::bad_request_code("Image is required", "missing_image"));
    }
    if files.len() > MAX_EDIT_IMAGES {
        return Err(AppError::bad_request_code(
            format!("Too many images. Maximum is {MAX_EDIT_IMAGES}."),
            "invalid_image_count",
        ));
    }
    files
        .iter()
        .map(|f| {
            let mime = validate_image(f)?;
            Ok(MediaRef::Inline {
                mime: mime.to_string(),
                base64: base64::engine::general_purpose::STANDARD.encode(&f.bytes),
            })
        })
        .collect()
}
