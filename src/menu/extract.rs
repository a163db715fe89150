use crate::llm::LlmClient;
use crate::menu::models::ProductDraft;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

const EXTRACTION_PROMPT: &str = r#"
You are a menu digitization agent. You are given a photo of a restaurant menu.
Extract every distinct product on it and respond with a JSON array only, no
prose. Each element must be an object with these fields:
  name (string), description (string, may be empty), price (number),
  category (string, the menu section the item appears under),
  variants (array of {type, name, priceModifier, isAbsolutePrice, isDefault}).
Use variants for size/flavor/extras choices printed with the item; type is the
axis name (e.g. "Size"), priceModifier the surcharge, isAbsolutePrice true when
the printed amount replaces the base price. Prices are plain numbers without
currency symbols. If a value is unreadable, make the best reasonable guess.
Output JSON only.
"#;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("vision request failed: {0}")]
    Vision(String),
    #[error("unable to parse menu draft json")]
    Parse,
}

// Greedy span from the first '[' to the last ']'; the salvage pass for
// answers that wrap the array in prose despite the prompt.
static ARRAY_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[\s\S]*\]").expect("array span regex"));

/// Run the vision model over one uploaded photo and parse its answer into
/// drafts. Any failure makes this image contribute zero drafts; the caller
/// logs and moves on, it is never retried.
pub async fn extract_drafts(
    llm: &LlmClient,
    image: &[u8],
    content_type: &str,
) -> Result<Vec<ProductDraft>, ExtractError> {
    let response = llm
        .vision(EXTRACTION_PROMPT, content_type, image)
        .await
        .map_err(|err| ExtractError::Vision(err.to_string()))?;
    parse_drafts(&response.text).ok_or(ExtractError::Parse)
}

/// Parse the model's textual answer: strip a markdown fence, parse as JSON,
/// and when that fails try the first `[...]` span. Anything that is not a
/// JSON array of draft objects is rejected.
pub fn parse_drafts(raw: &str) -> Option<Vec<ProductDraft>> {
    let cleaned = strip_markdown_fence(raw);
    let value = serde_json::from_str::<Value>(&cleaned)
        .ok()
        .or_else(|| salvage_array(&cleaned))?;
    if !value.is_array() {
        return None;
    }
    serde_json::from_value(value).ok()
}

fn salvage_array(input: &str) -> Option<Value> {
    let span = ARRAY_SPAN.find(input)?;
    serde_json::from_str::<Value>(span.as_str())
        .ok()
        .filter(Value::is_array)
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_array() {
        let raw = r#"[{"name": "Margherita", "price": 8.5, "category": "Pizza"}]"#;
        let drafts = parse_drafts(raw).expect("drafts");
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].name, "Margherita");
        assert_eq!(drafts[0].price, 8.5);
        assert_eq!(drafts[0].category, "Pizza");
        assert!(drafts[0].variants.is_empty());
    }

    #[test]
    fn parses_fenced_array() {
        let raw = "```json\n[{\"name\": \"Flat White\", \"price\": 3.2, \"category\": \"Coffee\"}]\n```";
        let drafts = parse_drafts(raw).expect("drafts");
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].name, "Flat White");
    }

    #[test]
    fn salvages_array_from_prose() {
        let raw = "Here is the extracted menu:\n[{\"name\": \"Empanada\", \"price\": 2.0, \"category\": \"Snacks\"}]\nLet me know if you need more.";
        let drafts = parse_drafts(raw).expect("drafts");
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].name, "Empanada");
    }

    #[test]
    fn rejects_non_array_answers() {
        assert!(parse_drafts(r#"{"name": "Not a list"}"#).is_none());
        assert!(parse_drafts("the menu was unreadable").is_none());
        assert!(parse_drafts("").is_none());
    }

    #[test]
    fn missing_fields_default() {
        let raw = r#"[{"name": "Agua"}]"#;
        let drafts = parse_drafts(raw).expect("drafts");
        assert_eq!(drafts[0].price, 0.0);
        assert!(drafts[0].description.is_none());
        assert!(drafts[0].category.is_empty());
    }

    #[test]
    fn parses_variants_with_camel_case_keys() {
        let raw = r#"[{
            "name": "Latte",
            "price": 4.0,
            "category": "Coffee",
            "variants": [
                {"type": "Size", "name": "Small", "priceModifier": 0, "isDefault": true},
                {"type": "Size", "name": "Large", "priceModifier": 1.5},
                {"type": "Milk", "name": "Oat", "priceModifier": 0.5}
            ]
        }]"#;
        let drafts = parse_drafts(raw).expect("drafts");
        let variants = &drafts[0].variants;
        assert_eq!(variants.len(), 3);
        assert_eq!(variants[0].type_name, "Size");
        assert!(variants[0].is_default);
        assert_eq!(variants[1].price_modifier, 1.5);
        assert!(!variants[1].is_absolute_price);
        assert_eq!(variants[2].type_name, "Milk");
    }

    #[test]
    fn empty_array_is_valid() {
        let drafts = parse_drafts("[]").expect("drafts");
        assert!(drafts.is_empty());
    }
}
