//! Storefront catalog client used by full sweeps.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, RequestBuilder, header::LINK};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::Product;

const PAGE_LIMIT: u32 = 250;
const MAX_PAGES: usize = 1_000;

static NEXT_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#).expect("valid link regex"));

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("catalog returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("pagination did not terminate after {0} pages")]
    Pagination(usize),
}

#[derive(Debug, Clone)]
enum CatalogAuth {
    AccessToken(String),
    Basic { api_key: String, password: String },
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    store_url: String,
    api_version: String,
    auth: CatalogAuth,
}

impl CatalogConfig {
    /// `None` when neither an access token nor a key/password pair is given.
    /// The access token wins when both are present.
    pub fn new(
        store_url: String,
        api_version: String,
        access_token: Option<String>,
        basic: Option<(String, String)>,
    ) -> Option<Self> {
        let auth = match (access_token, basic) {
            (Some(token), _) => CatalogAuth::AccessToken(token),
            (None, Some((api_key, password))) => CatalogAuth::Basic { api_key, password },
            (None, None) => return None,
        };
        Some(Self {
            store_url: store_url.trim_end_matches('/').to_string(),
            api_version,
            auth,
        })
    }

    fn first_page(&self) -> String {
        format!(
            "{}/admin/api/{}/products.json?limit={PAGE_LIMIT}",
            self.store_url, self.api_version
        )
    }
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_products(&self) -> Result<Vec<Product>, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct ShopifyCatalog {
    http: Client,
    config: CatalogConfig,
}

#[derive(Deserialize)]
struct ProductPage {
    #[serde(default)]
    products: Vec<Product>,
}

impl ShopifyCatalog {
    pub fn new(http: Client, config: CatalogConfig) -> Self {
        Self { http, config }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.auth {
            CatalogAuth::AccessToken(token) => request.header("X-Shopify-Access-Token", token),
            CatalogAuth::Basic { api_key, password } => {
                request.basic_auth(api_key, Some(password))
            }
        }
    }
}

#[async_trait]
impl CatalogSource for ShopifyCatalog {
    async fn fetch_products(&self) -> Result<Vec<Product>, CatalogError> {
        let mut products = Vec::new();
        let mut next = Some(self.config.first_page());
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            if pages == MAX_PAGES {
                return Err(CatalogError::Pagination(pages));
            }
            pages += 1;
            let response = self
                .authorize(self.http.get(&url))
                .send()
                .await
                .map_err(|err| CatalogError::Request(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(CatalogError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_page_url);
            let page: ProductPage = response
                .json()
                .await
                .map_err(|err| CatalogError::Deserialize(err.to_string()))?;
            debug!(target = "vsync.catalog", page = pages, count = page.products.len(), "catalog_page_fetched");
            if page.products.is_empty() {
                break;
            }
            products.extend(page.products);
        }

        info!(target = "vsync.catalog", pages, products = products.len(), "catalog_fetched");
        Ok(products)
    }
}

/// Extracts the `rel="next"` target from an RFC 8288 `Link` header.
pub fn next_page_url(header: &str) -> Option<String> {
    header
        .split(',')
        .find_map(|part| NEXT_LINK.captures(part.trim()))
        .map(|caps| caps[1].to_string())
}
