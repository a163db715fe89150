pub mod generate;
pub mod search;

pub use generate::generate_image;
pub use search::{ImageSearchClient, search_web_image};

use crate::http::{self, FetchError};
use crate::llm::GeneratedImage;
use reqwest::Client;
use std::time::Duration;
use tracing::warn;

const DOWNLOAD_DEADLINE: Duration = Duration::from_secs(15);
const DOWNLOAD_BYTE_CAP: u64 = 10 * 1024 * 1024;

/// A sourced candidate image before it reaches the storage sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    Url(String),
    Inline(Vec<u8>),
}

impl From<GeneratedImage> for ImagePayload {
    fn from(value: GeneratedImage) -> Self {
        match value {
            GeneratedImage::Url(url) => ImagePayload::Url(url),
            GeneratedImage::Inline(bytes) => ImagePayload::Inline(bytes),
        }
    }
}

/// Turn a candidate into uploadable bytes plus a content type. URLs are
/// downloaded under a 15 s deadline and a 10 MB cap; inline payloads are
/// passed through. `None` means the product stays imageless.
pub async fn candidate_bytes(http: &Client, payload: &ImagePayload) -> Option<(Vec<u8>, String)> {
    match payload {
        ImagePayload::Inline(bytes) => Some((bytes.clone(), "image/png".to_string())),
        ImagePayload::Url(url) => {
            match http::fetch_bytes_capped(http, url, DOWNLOAD_DEADLINE, DOWNLOAD_BYTE_CAP).await {
                Ok((bytes, content_type)) => {
                    Some((bytes, content_type.unwrap_or_else(|| "image/jpeg".to_string())))
                }
                Err(FetchError::TooLarge(cap)) => {
                    warn!(target = "carta.images", url = %url, cap, "image rejected, over byte cap");
                    None
                }
                Err(err) => {
                    warn!(target = "carta.images", url = %url, error = %err, "image download failed");
                    None
                }
            }
        }
    }
}

/// File extension for the storage object path, from the payload content type.
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type.split(';').next().unwrap_or_default().trim() {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_follows_content_type() {
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("image/webp; charset=binary"), "webp");
        assert_eq!(extension_for("application/octet-stream"), "jpg");
    }

    #[tokio::test]
    async fn inline_payload_skips_the_network() {
        let http = Client::new();
        let payload = ImagePayload::Inline(vec![1, 2, 3]);
        let (bytes, content_type) = candidate_bytes(&http, &payload).await.expect("bytes");
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(content_type, "image/png");
    }
}
