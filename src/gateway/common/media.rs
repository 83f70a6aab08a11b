use super::extract::MediaRef;
use crate::assets::extension_for;
use crate::upstream::{GrokClient, UploadedFile, UpstreamError};
use crate::util::concurrency::gather_limited;
use crate::util::id;
use base64::Engine;

/// 把媒体逐个上传到上游，最多 `concurrency` 个同时进行；任一失败即整体失败。
pub async fn upload_media(
    client: &GrokClient,
    token: &str,
    media: &[MediaRef],
    concurrency: usize,
) -> Result<Vec<UploadedFile>, UpstreamError> {
    if media.is_empty() {
        return Ok(Vec::new());
    }

    let factories: Vec<_> = media
        .iter()
        .map(|m| move || upload_one(client, token, m))
        .collect();
    gather_limited(factories, concurrency.min(media.len()))
        .await
        .into_iter()
        .collect()
}

async fn upload_one(client: &GrokClient, token: &str, media: &MediaRef) -> Result<UploadedFile, UpstreamError> {
    match media {
        MediaRef::Inline { mime, base64 } => {
            let name = id::upload_name(extension_for(mime));
            client.upload_file(token, &name, mime, base64).await
        }
        MediaRef::Remote(url) => {
            let (bytes, mime) = client.download(url).await?;
            let mime = mime.split(';').next().unwrap_or("").trim().to_string();
            let name = id::upload_name(extension_for(&mime));
            let content = base64::engine::general_purpose::STANDARD.encode(&bytes);
            client.upload_file(token, &name, &mime, &content).await
        }
    }
}
