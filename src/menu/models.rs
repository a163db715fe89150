use serde::{Deserialize, Serialize};

/// One product candidate extracted from a menu photo. Never persisted as-is;
/// the resolver decides whether it merges into an existing catalog row or
/// becomes a new one.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub variants: Vec<VariantDraft>,
}

/// One customization option on a draft. `type` names the axis ("Size"),
/// `name` the option ("Large"). `price_modifier` is a delta unless
/// `is_absolute_price` marks it as a full replacement price.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantDraft {
    #[serde(rename = "type", default)]
    pub type_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub price_modifier: f64,
    #[serde(default)]
    pub is_absolute_price: bool,
    #[serde(default)]
    pub is_default: bool,
}
