pub mod extract;
pub mod models;

pub use extract::{ExtractError, extract_drafts, parse_drafts};
pub use models::{ProductDraft, VariantDraft};
