//! Product name to archive URL resolution.

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::fetch::{RetryPolicy, retry};

/// Default ASF search endpoint.
pub const ASF_SEARCH_URL: &str = "https://api.daac.asf.alaska.edu/services/search/param";

/// Resolves product names to downloadable archive locations.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Archive URL for one product; [`Error::NotFound`] if the catalog does
    /// not know it.
    async fn resolve(&self, product: &str) -> Result<String>;

    /// Resolve several products, one result per input, in input order.
    async fn resolve_all(&self, products: &[String]) -> Vec<(String, Result<String>)> {
        let mut out = Vec::with_capacity(products.len());
        for product in products {
            out.push((product.clone(), self.resolve(product).await));
        }
        out
    }
}

/// Resolver backed by the ASF search API.
pub struct AsfCatalog {
    client: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    properties: Properties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Properties {
    scene_name: Option<String>,
    #[serde(rename = "fileID")]
    file_id: Option<String>,
    url: Option<String>,
    #[serde(default)]
    processing_level: String,
}

impl AsfCatalog {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(ASF_SEARCH_URL)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::connection("http client", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        })
    }

    /// Retry transient search failures under `policy`, giving up on `cancel`.
    pub fn with_retry(mut self, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        self.retry = policy;
        self.cancel = cancel;
        self
    }

    /// Search for all products at once; returns `(product, url)` pairs for
    /// the archives found, metadata-only products excluded.
    #[instrument(level = "debug", skip(self, products), fields(count = products.len()))]
    async fn search(&self, products: &[String]) -> Result<Vec<(String, String)>> {
        let found = retry(&self.retry, &self.cancel, &self.endpoint, || {
            self.search_once(products)
        })
        .await?;
        debug!(found = found.len(), "catalog search finished");
        Ok(found)
    }

    async fn search_once(&self, products: &[String]) -> Result<Vec<(String, String)>> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("granule_list", products.join(",")),
                ("output", "geojson".to_string()),
            ])
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&self.endpoint, e))?;
        if !resp.status().is_success() {
            return Err(Error::from_status(&self.endpoint, resp.status().as_u16()));
        }

        let body: SearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::from_reqwest(&self.endpoint, e))?;

        Ok(body
            .features
            .into_iter()
            .map(|f| f.properties)
            .filter(|p| !p.processing_level.contains("METADATA"))
            .filter_map(|p| {
                let name = p.scene_name.or(p.file_id)?;
                Some((name, p.url?))
            })
            .collect())
    }
}

#[async_trait]
impl Resolver for AsfCatalog {
    async fn resolve(&self, product: &str) -> Result<String> {
        let found = self.search(&[product.to_string()]).await?;
        lookup(&found, product).ok_or_else(|| Error::not_found(product))
    }

    async fn resolve_all(&self, products: &[String]) -> Vec<(String, Result<String>)> {
        if products.is_empty() {
            return Vec::new();
        }

        let found = match self.search(products).await {
            Ok(found) => found,
            Err(e) => {
                return products
                    .iter()
                    .map(|p| (p.clone(), Err(e.with_location(p.clone()))))
                    .collect();
            }
        };

        let resolved: Vec<_> = products
            .iter()
            .map(|p| {
                let url = lookup(&found, p).ok_or_else(|| Error::not_found(p.clone()));
                (p.clone(), url)
            })
            .collect();

        let hits = resolved.iter().filter(|(_, r)| r.is_ok()).count();
        if hits != products.len() {
            warn!(
                "only {} of the {} requested products found on the remote server",
                hits,
                products.len()
            );
        }
        resolved
    }
}

/// Scene names may carry a product-type suffix (`-SLC`); match on the prefix.
fn lookup(found: &[(String, String)], product: &str) -> Option<String> {
    found
        .iter()
        .find(|(name, _)| name == product || name.starts_with(&format!("{product}-")))
        .map(|(_, url)| url.clone())
}
