use crate::http::build_client;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    bucket: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("empty response")]
    Empty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogProduct {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantType {
    pub id: Uuid,
    pub name: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct NewProductRow<'a> {
    pub owner_id: Uuid,
    pub category_id: Uuid,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub price: f64,
    pub sku: String,
    pub currency: String,
    pub stock: i32,
    pub min_stock: i32,
    pub is_active: bool,
    pub show_in_digital_menu: bool,
    pub show_in_pos: bool,
    pub image_url: Option<String>,
}

/// Partial update for a matched product. Absent fields are left untouched by
/// PostgREST, which is how extracted-but-empty values preserve the catalog's
/// existing ones.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ProductPatch<'a> {
    pub price: Option<f64>,
    pub description: Option<&'a str>,
    pub category_id: Uuid,
    pub is_active: bool,
    pub show_in_digital_menu: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewVariantRow<'a> {
    pub product_id: Uuid,
    pub variant_type_id: Uuid,
    pub name: &'a str,
    pub price_modifier: f64,
    pub is_absolute_price: bool,
    pub is_default: bool,
    pub sort_order: i32,
}

#[derive(Serialize)]
struct NewCategoryRow<'a> {
    name: &'a str,
    owner_id: Uuid,
    show_in_digital_menu: bool,
    show_in_pos: bool,
}

#[derive(Serialize)]
struct NewVariantTypeRow<'a> {
    name: &'a str,
    owner_id: Uuid,
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        let bucket = std::env::var("SUPABASE_STORAGE_BUCKET")
            .unwrap_or_else(|_| "product-images".into());
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            bucket,
            http: build_client(),
        })
    }

    pub async fn fetch_categories(&self, owner_id: Uuid) -> Result<Vec<Category>, SupabaseError> {
        self.get_rows(&format!(
            "categories?owner_id=eq.{owner_id}&select=id,name&order=created_at.asc"
        ))
        .await
    }

    pub async fn create_category(
        &self,
        owner_id: Uuid,
        name: &str,
    ) -> Result<Category, SupabaseError> {
        self.insert_row(
            "categories",
            &NewCategoryRow {
                name,
                owner_id,
                show_in_digital_menu: true,
                show_in_pos: false,
            },
        )
        .await
    }

    pub async fn fetch_products(&self, owner_id: Uuid) -> Result<Vec<CatalogProduct>, SupabaseError> {
        self.get_rows(&format!(
            "products?owner_id=eq.{owner_id}&select=id,name&order=created_at.asc"
        ))
        .await
    }

    pub async fn insert_product(
        &self,
        row: &NewProductRow<'_>,
    ) -> Result<CatalogProduct, SupabaseError> {
        self.insert_row("products", row).await
    }

    pub async fn update_product(
        &self,
        id: Uuid,
        patch: &ProductPatch<'_>,
    ) -> Result<(), SupabaseError> {
        let url = format!("{}/rest/v1/products?id=eq.{id}", self.base_url);
        let response = self
            .http
            .patch(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .json(patch)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn fetch_variant_types(
        &self,
        owner_id: Uuid,
    ) -> Result<Vec<VariantType>, SupabaseError> {
        self.get_rows(&format!(
            "variant_types?owner_id=eq.{owner_id}&select=id,name&order=created_at.asc"
        ))
        .await
    }

    pub async fn create_variant_type(
        &self,
        owner_id: Uuid,
        name: &str,
    ) -> Result<VariantType, SupabaseError> {
        self.insert_row("variant_types", &NewVariantTypeRow { name, owner_id })
            .await
    }

    pub async fn insert_variant(&self, row: &NewVariantRow<'_>) -> Result<(), SupabaseError> {
        let url = format!("{}/rest/v1/variants", self.base_url);
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .json(row)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Storage sink: upload raw bytes and hand back the stable public URL.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        path: &str,
    ) -> Result<String, SupabaseError> {
        let url = format!(
            "{}/storage/v1/object/{}/{path}",
            self.base_url, self.bucket
        );
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(self.public_object_url(path))
    }

    pub fn public_object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{path}",
            self.base_url, self.bucket
        )
    }

    async fn get_rows<T: DeserializeOwned>(&self, query: &str) -> Result<Vec<T>, SupabaseError> {
        let url = format!("{}/rest/v1/{query}", self.base_url);
        let response = self
            .http
            .get(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))
    }

    async fn insert_row<T: DeserializeOwned, B: Serialize>(
        &self,
        table: &str,
        body: &B,
    ) -> Result<T, SupabaseError> {
        let url = format!("{}/rest/v1/{table}", self.base_url);
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let mut rows: Vec<T> = response
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))?;
        rows.pop().ok_or(SupabaseError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SupabaseClient {
        SupabaseClient {
            base_url: "https://demo.supabase.co".into(),
            service_key: "svc".into(),
            bucket: "product-images".into(),
            http: Client::new(),
        }
    }

    #[test]
    fn public_url_joins_bucket_and_path() {
        assert_eq!(
            client().public_object_url("menu-imports/a.jpg"),
            "https://demo.supabase.co/storage/v1/object/public/product-images/menu-imports/a.jpg"
        );
    }

    #[test]
    fn product_patch_omits_preserved_fields() {
        let id = Uuid::nil();
        let patch = ProductPatch {
            price: None,
            description: None,
            category_id: id,
            is_active: true,
            show_in_digital_menu: true,
        };
        let value = serde_json::to_value(&patch).expect("json");
        let object = value.as_object().expect("object");
        assert!(!object.contains_key("price"));
        assert!(!object.contains_key("description"));
        assert!(object.contains_key("category_id"));
    }
}
