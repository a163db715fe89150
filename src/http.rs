use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_stream::StreamExt;

pub fn build_client() -> Client {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(15);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Client for gateway completion calls, which run much longer than the
/// provider lookups covered by [`build_client`].
pub fn build_llm_client() -> Client {
    let timeout = std::env::var("LLM_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(120);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("http status {0}")]
    Status(u16),
    #[error("response larger than {0} byte cap")]
    TooLarge(u64),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Download a payload under a hard deadline and byte cap. The body is read
/// chunk by chunk so an oversized response is rejected without buffering past
/// the cap. Returns the bytes plus the response `Content-Type`, if any.
pub async fn fetch_bytes_capped(
    http: &Client,
    url: &str,
    deadline: Duration,
    max_bytes: u64,
) -> Result<(Vec<u8>, Option<String>), FetchError> {
    timeout(deadline, async {
        let response = http
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        if let Some(declared) = response.content_length()
            && declared > max_bytes
        {
            return Err(FetchError::TooLarge(declared));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| FetchError::Request(err.to_string()))?;
            if (body.len() + chunk.len()) as u64 > max_bytes {
                return Err(FetchError::TooLarge(max_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        Ok((body, content_type))
    })
    .await
    .map_err(|_| FetchError::Timeout(deadline))?
}

/// Issue a GET under a hard deadline and report the final URL after the
/// client has followed redirects.
pub async fn resolve_redirect(
    http: &Client,
    url: &str,
    deadline: Duration,
) -> Result<String, FetchError> {
    timeout(deadline, async {
        let response = http
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        Ok(response.url().to_string())
    })
    .await
    .map_err(|_| FetchError::Timeout(deadline))?
}
