use crate::http::{self, build_client};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const REDIRECT_DEADLINE: Duration = Duration::from_secs(10);

/// Client for the photo-search provider (Pexels-shaped API). Absent when no
/// key is configured; the chain then goes straight to the redirect fallback.
#[derive(Debug, Clone)]
pub struct ImageSearchClient {
    http: Client,
    api_key: String,
    endpoint: String,
}

impl ImageSearchClient {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("PEXELS_API_KEY").ok()?;
        let endpoint = std::env::var("PEXELS_ENDPOINT")
            .unwrap_or_else(|_| "https://api.pexels.com/v1".into());
        Some(Self {
            http: build_client(),
            api_key,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// First result's landscape-size URL for a query, or `None` when the
    /// provider has nothing for it.
    pub async fn first_landscape_url(&self, query: &str) -> Option<String> {
        let url = format!(
            "{}/search?query={}&per_page=3&orientation=landscape",
            self.endpoint,
            urlencoding::encode(query)
        );
        let response = match self
            .http
            .get(url)
            .header("Authorization", &self.api_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(target = "carta.images", query, error = %err, "photo search request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(
                target = "carta.images",
                query,
                status = response.status().as_u16(),
                "photo search rejected"
            );
            return None;
        }
        let payload: SearchResponse = response.json().await.ok()?;
        payload
            .photos
            .into_iter()
            .find_map(|photo| photo.src.landscape.or(photo.src.original))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    photos: Vec<Photo>,
}

#[derive(Debug, Deserialize)]
struct Photo {
    src: PhotoSrc,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct PhotoSrc {
    landscape: Option<String>,
    original: Option<String>,
}

/// Successively looser queries for one product.
pub fn search_queries(name: &str, category: &str) -> Vec<String> {
    let name = name.trim();
    let category = category.trim();
    let mut queries = vec![format!("{name} food")];
    if !category.is_empty() {
        queries.push(format!("{name} {category} dish"));
        queries.push(format!("{category} food"));
    } else {
        queries.push(name.to_string());
    }
    queries
}

/// The web-search step of the chain: each query against the photo provider,
/// then the keyword-redirect service under its own hard deadline. Returns a
/// direct image URL or nothing; never an error.
pub async fn search_web_image(
    search: Option<&ImageSearchClient>,
    http: &Client,
    name: &str,
    category: &str,
) -> Option<String> {
    if let Some(client) = search {
        for query in search_queries(name, category) {
            if let Some(url) = client.first_landscape_url(&query).await {
                return Some(url);
            }
        }
    }
    redirect_fallback(http, name).await
}

async fn redirect_fallback(http: &Client, keywords: &str) -> Option<String> {
    let base = std::env::var("IMAGE_REDIRECT_BASE")
        .unwrap_or_else(|_| "https://source.unsplash.com/featured/".into());
    let url = format!("{base}?{}", urlencoding::encode(keywords.trim()));
    match http::resolve_redirect(http, &url, REDIRECT_DEADLINE).await {
        Ok(resolved) => Some(resolved),
        Err(err) => {
            warn!(target = "carta.images", keywords, error = %err, "redirect fallback failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queries_loosen_in_order() {
        let queries = search_queries("Empanada de Queso", "Snacks");
        assert_eq!(
            queries,
            vec![
                "Empanada de Queso food",
                "Empanada de Queso Snacks dish",
                "Snacks food",
            ]
        );
    }

    #[test]
    fn queries_without_category_stay_on_the_name() {
        let queries = search_queries("Ceviche", "  ");
        assert_eq!(queries, vec!["Ceviche food", "Ceviche"]);
    }

    #[test]
    fn search_client_absent_without_key() {
        // Key intentionally not set in the test environment.
        if std::env::var("PEXELS_API_KEY").is_err() {
            assert!(ImageSearchClient::from_env().is_none());
        }
    }
}
