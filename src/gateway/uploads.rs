//! 图片上传与网关缓存资源的读取。

use crate::api_keys::Caller;
use crate::assets::content_type_for;
use crate::error::AppError;
use crate::gateway::AppState;
use crate::gateway::images::form::{read_single_file, validate_image};
use axum::Extension;
use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct UploadResult {
    pub url: String,
    pub name: String,
    pub size_bytes: usize,
}

pub async fn handle_upload_image(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    multipart: Multipart,
) -> Result<Json<UploadResult>, AppError> {
    let file = read_single_file(multipart, "file").await?;
    let mime = validate_image(&file)?;
    let size_bytes = file.bytes.len();
    let name = state.assets.put(file.bytes, mime).await;
    tracing::info!(key_name = %caller.key_name(), name = %name, size_bytes, "图片已上传");
    Ok(Json(UploadResult {
        url: state.assets.public_url(&name),
        name,
        size_bytes,
    }))
}

pub async fn handle_get_file(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.assets.get(&name).await {
        Some(asset) => {
            let content_type = if asset.content_type.is_empty() {
                content_type_for(&name).to_string()
            } else {
                asset.content_type
            };
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, "public, max-age=3600".to_string()),
                ],
                asset.bytes,
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "File not found").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use crate::gateway::build_router;
    use crate::gateway::testutil::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use sonic_rs::JsonValueTrait;
    use tower::ServiceExt;

    fn upload_request(file_name: &str, ct: &str, bytes: &[u8]) -> Request<Body> {
        let boundary = "UPBOUNDARY";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
                 Content-Type: {ct}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri("/v1/uploads/image")
            .header(header::AUTHORIZATION, "Bearer admin")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_then_fetch() {
        let (_dir, state) = state_with_upstream("http://127.0.0.1:1", "admin").await;
        let app = build_router(state);

        let resp = app
            .clone()
            .oneshot(upload_request("cat.webp", "image/webp", &[9, 9, 9]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["size_bytes"].as_u64(), Some(3));
        let url = v["url"].as_str().unwrap().to_string();
        assert!(url.ends_with(v["name"].as_str().unwrap()));

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(url)
                    .header(header::AUTHORIZATION, "Bearer admin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "image/webp");
        assert_eq!(body_text(resp).await.as_bytes(), &[9, 9, 9]);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/v1/files/image/missing.png")
                    .header(header::AUTHORIZATION, "Bearer admin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_rejects_unsupported_type() {
        let (_dir, state) = state_with_upstream("http://127.0.0.1:1", "admin").await;
        let resp = build_router(state)
            .oneshot(upload_request("a.gif", "image/gif", &[1]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"].as_str(), Some("invalid_image_type"));
    }
}
