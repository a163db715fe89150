use serde::{Deserialize, Serialize};

/// One uploaded menu photo. Ephemeral, owned by a single request.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Image-sourcing switches from the multipart form; both default off.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    pub search_web_images: bool,
    pub generate_ai_images: bool,
}

#[derive(Debug, Clone)]
pub struct MenuImportRequest {
    pub images: Vec<UploadedImage>,
    pub options: ImportOptions,
}

/// Terminal artifact of a batch. Per-item failures land in `errors`; the
/// counts only move for rows that actually persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub products_added: usize,
    pub products_updated: usize,
    pub total_extracted: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_serializes_camel_case() {
        let result = PipelineResult {
            products_added: 4,
            products_updated: 2,
            total_extracted: 7,
            errors: vec!["No category assignable for Flan".into()],
        };
        let value = serde_json::to_value(&result).expect("json");
        let object = value.as_object().expect("object");
        assert!(object.contains_key("productsAdded"));
        assert!(object.contains_key("productsUpdated"));
        assert!(object.contains_key("totalExtracted"));
        assert_eq!(value["errors"][0], "No category assignable for Flan");
    }
}
