use crate::http::build_llm_client;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub extraction_function: Option<String>,
    pub generation_function: Option<String>,
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: std::env::var("TENSORZERO_GATEWAY_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            api_key: std::env::var("TENSORZERO_API_KEY").ok(),
            extraction_function: std::env::var("TENSORZERO_EXTRACTION_FUNCTION").ok(),
            generation_function: std::env::var("TENSORZERO_GENERATION_FUNCTION").ok(),
            model: std::env::var("TENSORZERO_MODEL").ok(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[allow(dead_code)]
    #[serde(default)]
    pub usage: Option<LlmUsage>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// A sourced image out of the generation function: either a URL the caller
/// still has to download, or bytes already inline in the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratedImage {
    Url(String),
    Inline(Vec<u8>),
}

pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_llm_client(),
            config,
        }
    }

    /// One multimodal completion: the extraction prompt plus a single image
    /// passed as a base64 data URL content part.
    pub async fn vision(
        &self,
        prompt: &str,
        content_type: &str,
        image: &[u8],
    ) -> Result<LlmResponse, LlmError> {
        let gateway = self.gateway()?;
        let function_name = self
            .config
            .extraction_function
            .as_deref()
            .unwrap_or("menu_extraction");

        let data_url = format!("data:{content_type};base64,{}", BASE64.encode(image));
        let body = InferenceRequest {
            function_name: function_name.to_string(),
            model_name: self.config.model.clone(),
            input: InferenceInput {
                messages: vec![VisionMessage {
                    role: "user".into(),
                    content: vec![
                        ContentPart::Text {
                            text: prompt.to_string(),
                        },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl { url: data_url },
                        },
                    ],
                }],
            },
        };

        let payload: TensorZeroResponse = self.post_inference(gateway, &body).await?;
        let text = payload
            .content
            .into_iter()
            .find(|item| item.kind == "text")
            .and_then(|item| item.text)
            .ok_or_else(|| LlmError::InvalidResponse("missing text".into()))?;

        Ok(LlmResponse {
            text,
            usage: payload.usage,
        })
    }

    /// One generation request; the answer is normalized into a URL or inline
    /// bytes by [`parse_generated_image`]. `Ok(None)` means the model did not
    /// return a usable image.
    pub async fn generate_image(&self, prompt: &str) -> Result<Option<GeneratedImage>, LlmError> {
        let gateway = self.gateway()?;
        let function_name = self
            .config
            .generation_function
            .as_deref()
            .unwrap_or("menu_image_generation");

        let body = InferenceRequest {
            function_name: function_name.to_string(),
            model_name: self.config.model.clone(),
            input: InferenceInput {
                messages: vec![VisionMessage {
                    role: "user".into(),
                    content: vec![ContentPart::Text {
                        text: prompt.to_string(),
                    }],
                }],
            },
        };

        let payload: Value = self.post_inference(gateway, &body).await?;
        Ok(parse_generated_image(&payload))
    }

    fn gateway(&self) -> Result<&str, LlmError> {
        let gateway = self.config.gateway_url.trim();
        if gateway.is_empty() {
            return Err(LlmError::MissingGateway);
        }
        Ok(gateway)
    }

    async fn post_inference<T: serde::de::DeserializeOwned>(
        &self,
        gateway: &str,
        body: &InferenceRequest,
    ) -> Result<T, LlmError> {
        let mut request = self.http.post(format!("{gateway}/inference")).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }

        response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))
    }
}

/// Pull an image out of a generation response. Providers answer in several
/// shapes: a bare `url`, an inline `b64_json`/`b64` payload, a nested
/// `{image_url: {url}}` object, or a `content`/`data` array whose items use
/// any of those. Data URLs are decoded to inline bytes.
pub fn parse_generated_image(payload: &Value) -> Option<GeneratedImage> {
    if let Some(found) = image_from_object(payload) {
        return Some(found);
    }
    for key in ["content", "data"] {
        if let Some(items) = payload.get(key).and_then(Value::as_array) {
            for item in items {
                if let Some(found) = image_from_object(item) {
                    return Some(found);
                }
            }
        }
    }
    None
}

fn image_from_object(value: &Value) -> Option<GeneratedImage> {
    if let Some(url) = value.get("url").and_then(Value::as_str) {
        return normalize_url(url);
    }
    if let Some(nested) = value
        .get("image_url")
        .and_then(|inner| inner.get("url"))
        .and_then(Value::as_str)
    {
        return normalize_url(nested);
    }
    for key in ["b64_json", "b64"] {
        if let Some(encoded) = value.get(key).and_then(Value::as_str) {
            return BASE64.decode(encoded.trim()).ok().map(GeneratedImage::Inline);
        }
    }
    None
}

fn normalize_url(url: &str) -> Option<GeneratedImage> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix("data:") {
        let encoded = rest.split_once("base64,").map(|(_, tail)| tail)?;
        return BASE64.decode(encoded).ok().map(GeneratedImage::Inline);
    }
    Some(GeneratedImage::Url(trimmed.to_string()))
}

#[derive(Debug, Serialize)]
struct InferenceRequest {
    function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    input: InferenceInput,
}

#[derive(Debug, Serialize)]
struct InferenceInput {
    messages: Vec<VisionMessage>,
}

#[derive(Debug, Serialize)]
struct VisionMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct TensorZeroResponse {
    content: Vec<ResponseContent>,
    #[serde(default)]
    usage: Option<LlmUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_image_from_direct_url() {
        let payload = json!({"url": "https://img.example/pizza.jpg"});
        assert_eq!(
            parse_generated_image(&payload),
            Some(GeneratedImage::Url("https://img.example/pizza.jpg".into()))
        );
    }

    #[test]
    fn generated_image_from_nested_image_url() {
        let payload = json!({
            "content": [
                {"type": "text", "text": "here you go"},
                {"image_url": {"url": "https://img.example/tacos.png"}},
            ]
        });
        assert_eq!(
            parse_generated_image(&payload),
            Some(GeneratedImage::Url("https://img.example/tacos.png".into()))
        );
    }

    #[test]
    fn generated_image_from_inline_base64() {
        let payload = json!({"data": [{"b64_json": "aGVsbG8="}]});
        assert_eq!(
            parse_generated_image(&payload),
            Some(GeneratedImage::Inline(b"hello".to_vec()))
        );
    }

    #[test]
    fn generated_image_decodes_data_url() {
        let payload = json!({"url": "data:image/png;base64,aGVsbG8="});
        assert_eq!(
            parse_generated_image(&payload),
            Some(GeneratedImage::Inline(b"hello".to_vec()))
        );
    }

    #[test]
    fn generated_image_absent() {
        assert_eq!(parse_generated_image(&json!({"content": []})), None);
        assert_eq!(parse_generated_image(&json!({"url": "  "})), None);
    }
}
