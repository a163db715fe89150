use crate::images::{self, ImagePayload, ImageSearchClient};
use crate::llm::{LlmClient, LlmConfig};
use crate::menu::extract;
use crate::menu::models::{ProductDraft, VariantDraft};
use crate::models::{ImportOptions, MenuImportRequest, PipelineResult};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::security::AuthContext;
use crate::supabase::{
    CatalogProduct, Category, NewProductRow, NewVariantRow, ProductPatch, SupabaseClient,
    VariantType,
};
use chrono::Utc;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const FALLBACK_CATEGORY: &str = "Uncategorized";

#[derive(Clone)]
pub struct Pipeline {
    pub llm: Arc<LlmClient>,
    supabase: Option<SupabaseClient>,
    image_search: Option<Arc<ImageSearchClient>>,
    http: Client,
}

impl Pipeline {
    pub fn from_env() -> Self {
        let llm = LlmClient::new(LlmConfig::from_env());
        let supabase = SupabaseClient::from_env();
        let image_search = ImageSearchClient::from_env().map(Arc::new);
        Self {
            llm: Arc::new(llm),
            supabase,
            image_search,
            http: crate::http::build_client(),
        }
    }

    /// Drive one batch start to finish. `Err` is reserved for whole-batch
    /// conditions; per-item failures are absorbed into the result's `errors`
    /// list and the iteration continues. Progress events flow through the
    /// sink as each sub-step completes, whether or not anyone is listening.
    pub async fn run(
        &self,
        request: MenuImportRequest,
        auth: Option<AuthContext>,
        progress: &ProgressSink,
    ) -> Result<PipelineResult, PipelineError> {
        let context =
            auth.ok_or_else(|| PipelineError::invalid_input("auth", "unauthenticated"))?;
        let owner = Uuid::parse_str(&context.owner_id)
            .map_err(|err| PipelineError::internal("auth", err.to_string()))?;
        let supabase = self
            .supabase
            .as_ref()
            .ok_or_else(|| PipelineError::internal("catalog", "catalog store is not configured"))?;

        progress
            .emit(ProgressEvent::Start {
                message: "Importing menu photos".into(),
            })
            .await;

        if request.images.is_empty() {
            return Err(PipelineError::invalid_input("receive", "no files uploaded"));
        }

        let started = Instant::now();
        let drafts = self.extract_all(&request, progress).await?;
        crate::metrics::stage_elapsed("extract", started.elapsed().as_millis());

        progress
            .emit(ProgressEvent::Extracted {
                count: drafts.len(),
            })
            .await;
        if drafts.is_empty() {
            return Err(PipelineError::invalid_input(
                "extract",
                "no products recognized in the uploaded photos",
            ));
        }

        // One snapshot per batch; reconciliation runs against it while the
        // caches absorb anything created mid-run.
        let categories = supabase
            .fetch_categories(owner)
            .await
            .map_err(|err| PipelineError::internal("catalog", err.to_string()))?;
        let products = supabase
            .fetch_products(owner)
            .await
            .map_err(|err| PipelineError::internal("catalog", err.to_string()))?;
        let variant_types = supabase
            .fetch_variant_types(owner)
            .await
            .map_err(|err| PipelineError::internal("catalog", err.to_string()))?;
        let mut resolver = CatalogResolver::new(owner, categories, products, variant_types);

        let started = Instant::now();
        let total = drafts.len();
        let mut result = PipelineResult {
            total_extracted: total,
            ..Default::default()
        };

        for (index, draft) in drafts.iter().enumerate() {
            let current = index + 1;
            // A disconnect drops the in-flight external call along with the
            // draft; nothing persisted so far is rolled back.
            tokio::select! {
                _ = progress.closed() => {
                    info!(target = "carta.api", owner = %owner, "client disconnected, aborting batch");
                    return Err(PipelineError::internal("stream", "client disconnected"));
                }
                _ = self.process_draft(
                    supabase,
                    &mut resolver,
                    draft,
                    current,
                    total,
                    &request.options,
                    progress,
                    &mut result,
                ) => {}
            }
        }
        crate::metrics::stage_elapsed("reconcile", started.elapsed().as_millis());

        info!(
            target = "carta.api",
            owner = %owner,
            added = result.products_added,
            updated = result.products_updated,
            errors = result.errors.len(),
            "batch finished"
        );
        Ok(result)
    }

    async fn extract_all(
        &self,
        request: &MenuImportRequest,
        progress: &ProgressSink,
    ) -> Result<Vec<ProductDraft>, PipelineError> {
        let total_images = request.images.len();
        let mut drafts = Vec::new();
        for (index, image) in request.images.iter().enumerate() {
            progress
                .emit(ProgressEvent::Analyzing {
                    message: format!("Analyzing menu photo {} of {total_images}", index + 1),
                })
                .await;
            let outcome = tokio::select! {
                _ = progress.closed() => {
                    return Err(PipelineError::internal("stream", "client disconnected"));
                }
                outcome = extract::extract_drafts(&self.llm, &image.bytes, &image.content_type) => outcome,
            };
            match outcome {
                Ok(mut extracted) => {
                    info!(
                        target = "carta.vision",
                        image = index,
                        drafts = extracted.len(),
                        "menu photo extracted"
                    );
                    drafts.append(&mut extracted);
                }
                // One bad photo cannot abort the batch; it just contributes
                // zero drafts and the loss shows up in the aggregate count.
                Err(err) => {
                    warn!(target = "carta.vision", image = index, error = %err, "menu photo skipped");
                }
            }
        }
        Ok(drafts)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_draft(
        &self,
        supabase: &SupabaseClient,
        resolver: &mut CatalogResolver,
        draft: &ProductDraft,
        current: usize,
        total: usize,
        options: &ImportOptions,
        progress: &ProgressSink,
        result: &mut PipelineResult,
    ) {
        let name = draft.name.trim();
        if name.is_empty() {
            result.errors.push("Skipped a draft with no product name".into());
            return;
        }

        let Some(category_id) = resolver.resolve_category(supabase, &draft.category).await else {
            result.errors.push(format!("No category assignable for {name}"));
            return;
        };

        let matched_id = match_existing(&resolver.products, name).map(|product| product.id);
        match matched_id {
            Some(existing_id) => {
                let patch = ProductPatch {
                    price: (draft.price > 0.0).then_some(draft.price),
                    description: draft
                        .description
                        .as_deref()
                        .map(str::trim)
                        .filter(|value| !value.is_empty()),
                    category_id,
                    is_active: true,
                    show_in_digital_menu: true,
                };
                match supabase.update_product(existing_id, &patch).await {
                    Ok(()) => {
                        result.products_updated += 1;
                        progress
                            .emit(ProgressEvent::ProductSaved {
                                product_name: name.to_string(),
                                current,
                                total,
                                save_type: "updated",
                            })
                            .await;
                        self.persist_variants(supabase, resolver, existing_id, name, draft, progress)
                            .await;
                    }
                    Err(err) => {
                        result.errors.push(format!("Failed to update {name}: {err}"));
                    }
                }
            }
            None => {
                let image_url = self
                    .source_image(supabase, draft, current, total, options, progress)
                    .await;
                let row = NewProductRow {
                    owner_id: resolver.owner,
                    category_id,
                    name,
                    description: draft
                        .description
                        .as_deref()
                        .map(str::trim)
                        .filter(|value| !value.is_empty()),
                    price: draft.price,
                    sku: generate_sku(),
                    currency: default_currency(),
                    stock: 0,
                    min_stock: 0,
                    is_active: true,
                    show_in_digital_menu: true,
                    show_in_pos: true,
                    image_url,
                };
                match supabase.insert_product(&row).await {
                    Ok(saved) => {
                        result.products_added += 1;
                        progress
                            .emit(ProgressEvent::ProductSaved {
                                product_name: name.to_string(),
                                current,
                                total,
                                save_type: "created",
                            })
                            .await;
                        self.persist_variants(supabase, resolver, saved.id, name, draft, progress)
                            .await;
                    }
                    Err(err) => {
                        result.errors.push(format!("Failed to create {name}: {err}"));
                    }
                }
            }
        }
    }

    /// Ordered fallback chain for a new product's photo: web search first,
    /// generation only when that produced nothing. Every failure mode ends
    /// with the product persisting imageless.
    async fn source_image(
        &self,
        supabase: &SupabaseClient,
        draft: &ProductDraft,
        current: usize,
        total: usize,
        options: &ImportOptions,
        progress: &ProgressSink,
    ) -> Option<String> {
        if !options.search_web_images && !options.generate_ai_images {
            return None;
        }
        let name = draft.name.trim();
        let mut payload: Option<ImagePayload> = None;

        if options.search_web_images {
            progress
                .emit(ProgressEvent::SearchingImage {
                    product_name: name.to_string(),
                    current,
                    total,
                })
                .await;
            match images::search_web_image(
                self.image_search.as_deref(),
                &self.http,
                name,
                &draft.category,
            )
            .await
            {
                Some(url) => {
                    progress
                        .emit(ProgressEvent::ImageFound {
                            product_name: name.to_string(),
                        })
                        .await;
                    payload = Some(ImagePayload::Url(url));
                }
                None => {
                    progress
                        .emit(ProgressEvent::ImageNotFound {
                            product_name: name.to_string(),
                            source: "web_search",
                        })
                        .await;
                }
            }
        }

        if payload.is_none() && options.generate_ai_images {
            progress
                .emit(ProgressEvent::GeneratingImage {
                    product_name: name.to_string(),
                    current,
                    total,
                })
                .await;
            match images::generate_image(&self.llm, name, draft.description.as_deref()).await {
                Some(generated) => {
                    progress
                        .emit(ProgressEvent::ImageGenerated {
                            product_name: name.to_string(),
                        })
                        .await;
                    payload = Some(generated);
                }
                None => {
                    progress
                        .emit(ProgressEvent::ImageNotFound {
                            product_name: name.to_string(),
                            source: "ai_generation",
                        })
                        .await;
                }
            }
        }

        let payload = payload?;
        let (bytes, content_type) = images::candidate_bytes(&self.http, &payload).await?;
        let path = storage_object_path(name, images::extension_for(&content_type));
        match supabase.upload_image(bytes, &content_type, &path).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(target = "carta.images", product = name, error = %err, "image upload failed");
                None
            }
        }
    }

    /// Variant groups ride along with the parent product. Failures here are
    /// logged and skipped, never rolled back and never surfaced in the
    /// terminal error list.
    async fn persist_variants(
        &self,
        supabase: &SupabaseClient,
        resolver: &mut CatalogResolver,
        product_id: Uuid,
        product_name: &str,
        draft: &ProductDraft,
        progress: &ProgressSink,
    ) {
        if draft.variants.is_empty() {
            return;
        }
        let mut created = 0usize;
        for (type_name, options) in group_variants(&draft.variants) {
            let Some(type_id) = resolver.resolve_variant_type(supabase, &type_name).await else {
                warn!(
                    target = "carta.catalog",
                    product = product_name,
                    variant_type = %type_name,
                    "variant type unresolved, group skipped"
                );
                continue;
            };
            for (position, option) in options.iter().enumerate() {
                let row = NewVariantRow {
                    product_id,
                    variant_type_id: type_id,
                    name: option.name.trim(),
                    price_modifier: option.price_modifier,
                    is_absolute_price: option.is_absolute_price,
                    is_default: option.is_default,
                    sort_order: position as i32,
                };
                match supabase.insert_variant(&row).await {
                    Ok(()) => created += 1,
                    Err(err) => {
                        warn!(
                            target = "carta.catalog",
                            product = product_name,
                            variant = %option.name,
                            error = %err,
                            "variant insert failed, skipped"
                        );
                    }
                }
            }
        }
        if created > 0 {
            progress
                .emit(ProgressEvent::VariantsCreated {
                    product_name: product_name.to_string(),
                    variant_count: created,
                })
                .await;
        }
    }
}

/// Request-scoped reconciliation state: the owner's catalog snapshots plus
/// the category and variant-type caches that prevent duplicate creation
/// within one batch. Owned by a single orchestrator run, never shared.
struct CatalogResolver {
    owner: Uuid,
    categories: Vec<Category>,
    products: Vec<CatalogProduct>,
    category_cache: HashMap<String, Uuid>,
    variant_type_cache: HashMap<String, Uuid>,
}

impl CatalogResolver {
    fn new(
        owner: Uuid,
        categories: Vec<Category>,
        products: Vec<CatalogProduct>,
        variant_types: Vec<VariantType>,
    ) -> Self {
        let variant_type_cache = variant_types
            .into_iter()
            .map(|vt| (vt.name.trim().to_lowercase(), vt.id))
            .collect();
        Self {
            owner,
            categories,
            products,
            category_cache: HashMap::new(),
            variant_type_cache,
        }
    }

    /// Cache and snapshot steps of category resolution; no network.
    fn cached_or_existing(&mut self, name: &str) -> Option<Uuid> {
        let key = name.to_lowercase();
        if let Some(id) = self.category_cache.get(&key) {
            return Some(*id);
        }
        let found = self
            .categories
            .iter()
            .find(|category| category.name.trim().to_lowercase() == key)
            .map(|category| category.id)?;
        self.category_cache.insert(key, found);
        Some(found)
    }

    /// Full resolution order: cache, snapshot, create, first-existing
    /// fallback. `None` means the draft has nowhere to go and is skipped.
    async fn resolve_category(
        &mut self,
        supabase: &SupabaseClient,
        raw_name: &str,
    ) -> Option<Uuid> {
        let name = effective_category_name(raw_name);
        if let Some(id) = self.cached_or_existing(name) {
            return Some(id);
        }
        match supabase.create_category(self.owner, name).await {
            Ok(created) => {
                self.category_cache.insert(name.to_lowercase(), created.id);
                Some(created.id)
            }
            Err(err) => {
                warn!(
                    target = "carta.catalog",
                    category = name,
                    error = %err,
                    "category create failed, falling back"
                );
                let fallback = self.categories.first().map(|category| category.id)?;
                self.category_cache.insert(name.to_lowercase(), fallback);
                Some(fallback)
            }
        }
    }

    /// Resolve-or-create, memoized per (lowercased type name, owner) so a
    /// type is created at most once per batch.
    async fn resolve_variant_type(
        &mut self,
        supabase: &SupabaseClient,
        name: &str,
    ) -> Option<Uuid> {
        let key = name.trim().to_lowercase();
        if let Some(id) = self.variant_type_cache.get(&key) {
            return Some(*id);
        }
        match supabase.create_variant_type(self.owner, name.trim()).await {
            Ok(created) => {
                self.variant_type_cache.insert(key, created.id);
                Some(created.id)
            }
            Err(err) => {
                warn!(
                    target = "carta.catalog",
                    variant_type = name,
                    error = %err,
                    "variant type create failed"
                );
                None
            }
        }
    }
}

fn effective_category_name(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        FALLBACK_CATEGORY
    } else {
        trimmed
    }
}

pub(crate) fn normalize_name(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Dedup rule: exact match after lowercase+trim, else mutual-substring with a
/// five-character floor on the shorter name. First match in catalog order
/// wins. Deliberately cheap; not edit distance.
pub(crate) fn match_existing<'a>(
    products: &'a [CatalogProduct],
    candidate: &str,
) -> Option<&'a CatalogProduct> {
    let needle = normalize_name(candidate);
    products.iter().find(|product| {
        let existing = normalize_name(&product.name);
        if existing == needle {
            return true;
        }
        let min_len = existing.chars().count().min(needle.chars().count());
        min_len >= 5 && (existing.contains(&needle) || needle.contains(&existing))
    })
}

/// Group a draft's variants by their type axis, first-seen order, matching
/// type names case-insensitively. Untyped options land in an "Options" group.
pub(crate) fn group_variants(variants: &[VariantDraft]) -> Vec<(String, Vec<&VariantDraft>)> {
    let mut groups: Vec<(String, Vec<&VariantDraft>)> = Vec::new();
    for variant in variants {
        let type_name = {
            let trimmed = variant.type_name.trim();
            if trimmed.is_empty() { "Options" } else { trimmed }
        };
        match groups
            .iter_mut()
            .find(|(name, _)| name.to_lowercase() == type_name.to_lowercase())
        {
            Some((_, members)) => members.push(variant),
            None => groups.push((type_name.to_string(), vec![variant])),
        }
    }
    groups
}

fn generate_sku() -> String {
    format!("MNU-{}", Uuid::new_v4().simple())
}

fn default_currency() -> String {
    std::env::var("CATALOG_CURRENCY").unwrap_or_else(|_| "USD".into())
}

fn sanitize_object_key(name: &str) -> String {
    let mapped: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect();
    let collapsed = mapped
        .split('-')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if collapsed.is_empty() {
        "product".into()
    } else {
        collapsed
    }
}

/// Collision-resistant storage path: timestamp, random suffix, sanitized
/// product name.
pub(crate) fn storage_object_path(name: &str, extension: &str) -> String {
    format!(
        "menu-imports/{}-{:08x}-{}.{extension}",
        Utc::now().timestamp_millis(),
        rand::random::<u32>(),
        sanitize_object_key(name)
    )
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(name: &str) -> CatalogProduct {
        CatalogProduct {
            id: Uuid::new_v4(),
            name: name.to_string(),
        }
    }

    fn variant(type_name: &str, name: &str) -> VariantDraft {
        VariantDraft {
            type_name: type_name.to_string(),
            name: name.to_string(),
            price_modifier: 0.0,
            is_absolute_price: false,
            is_default: false,
        }
    }

    #[test]
    fn dedup_exact_match_ignores_case_and_whitespace() {
        let products = vec![product("café americano ")];
        let matched = match_existing(&products, "Café Americano").expect("match");
        assert_eq!(matched.id, products[0].id);
    }

    #[test]
    fn dedup_substring_needs_five_chars() {
        let products = vec![product("Empanada de Queso")];
        assert!(match_existing(&products, "Empanada").is_some());

        let products = vec![product("Té Helado")];
        assert!(match_existing(&products, "Té").is_none());
        assert!(match_existing(&products, "té helado").is_some());
    }

    #[test]
    fn dedup_prefers_catalog_order() {
        let products = vec![product("Taco Supreme"), product("Taco Supremo")];
        let matched = match_existing(&products, "taco supreme").expect("match");
        assert_eq!(matched.id, products[0].id);
    }

    #[test]
    fn dedup_misses_unrelated_names() {
        let products = vec![product("Lomo Saltado")];
        assert!(match_existing(&products, "Ceviche Mixto").is_none());
    }

    #[test]
    fn category_lookup_is_case_insensitive_and_cached() {
        let owner = Uuid::new_v4();
        let existing = Category {
            id: Uuid::new_v4(),
            name: "Bebidas".into(),
        };
        let mut resolver = CatalogResolver::new(owner, vec![existing.clone()], vec![], vec![]);

        assert_eq!(resolver.cached_or_existing("BEBIDAS"), Some(existing.id));
        // Second occurrence in the same batch resolves from the cache.
        assert!(resolver.category_cache.contains_key("bebidas"));
        assert_eq!(resolver.cached_or_existing("bebidas"), Some(existing.id));
        assert_eq!(resolver.cached_or_existing("Postres"), None);
    }

    #[test]
    fn empty_category_name_defaults_to_sentinel() {
        assert_eq!(effective_category_name("   "), "Uncategorized");
        assert_eq!(effective_category_name(" Postres "), "Postres");
    }

    #[test]
    fn variant_type_cache_prefills_from_snapshot() {
        let owner = Uuid::new_v4();
        let size = VariantType {
            id: Uuid::new_v4(),
            name: "Size".into(),
        };
        let resolver = CatalogResolver::new(owner, vec![], vec![], vec![size.clone()]);
        assert_eq!(resolver.variant_type_cache.get("size"), Some(&size.id));
    }

    #[test]
    fn variants_group_by_type_in_draft_order() {
        let variants = vec![
            variant("Size", "Small"),
            variant("Milk", "Oat"),
            variant("size", "Large"),
            variant("", "Extra shot"),
        ];
        let groups = group_variants(&variants);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].0, "Size");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[0].1[1].name, "Large");
        assert_eq!(groups[1].0, "Milk");
        assert_eq!(groups[2].0, "Options");
    }

    #[test]
    fn storage_path_sanitizes_the_product_name() {
        let path = storage_object_path("Café Americano!", "jpg");
        assert!(path.starts_with("menu-imports/"));
        assert!(path.ends_with("-caf-americano.jpg"));

        let path = storage_object_path("¡¡¡", "png");
        assert!(path.ends_with("-product.png"));
    }

    #[test]
    fn skus_are_prefixed_and_unique() {
        let a = generate_sku();
        let b = generate_sku();
        assert!(a.starts_with("MNU-"));
        assert_ne!(a, b);
    }

    #[test]
    fn pipeline_error_carries_stage_and_kind() {
        let err = PipelineError::invalid_input("receive", "no files uploaded");
        assert_eq!(err.stage(), "receive");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(err.detail(), "no files uploaded");
    }
}
