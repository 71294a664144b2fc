//! Data catalog client
//!
//! The pipeline only needs two things from the catalog: a filtered search
//! returning key/value cells, and a fetch by id. `CkanCatalog` speaks the CKAN
//! action API; `StaticCatalog` serves a fixed list of cells for offline runs
//! and tests.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::scope::{FinancialYear, Sphere};

/// One catalog record as a flat key/value map.
pub type Cell = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("catalog action {action} failed: {message}")]
    Api { action: &'static str, message: String },

    #[error("unexpected catalog response: {0}")]
    Decode(String),
}

impl CatalogError {
    /// Network trouble is worth retrying; a malformed answer is not.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::Http(e) => !e.is_decode() && !e.is_builder(),
            CatalogError::Api { .. } => true,
            CatalogError::Decode(_) => false,
        }
    }
}

/// Filter, sort and page size of a catalog search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogQuery {
    pub filters: Vec<(String, String)>,
    pub sort: Option<String>,
    pub rows: Option<u32>,
}

impl CatalogQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, key: &str, value: &str) -> Self {
        self.filters.push((key.to_string(), value.to_string()));
        self
    }

    pub fn sort(mut self, sort: &str) -> Self {
        self.sort = Some(sort.to_string());
        self
    }

    pub fn rows(mut self, rows: u32) -> Self {
        self.rows = Some(rows);
        self
    }

    /// Solr filter query, every filter required: `+key:"value" +other:"x"`
    pub fn fq(&self) -> String {
        self.filters
            .iter()
            .map(|(k, v)| format!("+{}:\"{}\"", k, v.replace('"', "\\\"")))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// True when `cell` satisfies every filter (string or list-of-strings values).
    pub fn matches(&self, cell: &Cell) -> bool {
        self.filters.iter().all(|(key, wanted)| match cell.get(key) {
            Some(Value::String(s)) => s == wanted,
            Some(Value::Array(items)) => items.iter().any(|i| i.as_str() == Some(wanted)),
            _ => false,
        })
    }
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn search(&self, query: &CatalogQuery) -> Result<Vec<Cell>, CatalogError>;

    async fn get(&self, id: &str) -> Result<Option<Cell>, CatalogError>;
}

// =============================================================================
// CKAN
// =============================================================================

#[derive(Debug, Deserialize)]
struct ActionResponse<T> {
    success: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    results: Vec<Cell>,
}

#[derive(Clone)]
pub struct CkanCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl CkanCatalog {
    pub fn new(base_url: &str) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent("BudgetPortalImporter/1.0")
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/api/3/action/{}", self.base_url, action)
    }
}

fn unwrap_action<T>(action: &'static str, body: ActionResponse<T>) -> Result<T, CatalogError> {
    if !body.success {
        let message = body
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no error detail".to_string());
        return Err(CatalogError::Api { action, message });
    }
    body.result
        .ok_or_else(|| CatalogError::Decode(format!("{action} returned no result")))
}

#[async_trait]
impl CatalogClient for CkanCatalog {
    async fn search(&self, query: &CatalogQuery) -> Result<Vec<Cell>, CatalogError> {
        let mut params: Vec<(&str, String)> = vec![("fq", query.fq())];
        if let Some(sort) = &query.sort {
            params.push(("sort", sort.clone()));
        }
        if let Some(rows) = query.rows {
            params.push(("rows", rows.to_string()));
        }

        tracing::debug!(fq = %query.fq(), "Catalog search");
        let body: ActionResponse<SearchResult> = self
            .client
            .get(self.action_url("package_search"))
            .query(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(unwrap_action("package_search", body)?.results)
    }

    async fn get(&self, id: &str) -> Result<Option<Cell>, CatalogError> {
        let resp = self
            .client
            .get(self.action_url("package_show"))
            .query(&[("id", id)])
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: ActionResponse<Cell> = resp.error_for_status()?.json().await?;
        unwrap_action("package_show", body).map(Some)
    }
}

// =============================================================================
// Static catalog
// =============================================================================

/// In-memory catalog over a fixed list of cells, keyed by their `id`.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    cells: Vec<Cell>,
}

impl StaticCatalog {
    pub fn new(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogClient for StaticCatalog {
    async fn search(&self, query: &CatalogQuery) -> Result<Vec<Cell>, CatalogError> {
        let mut found: Vec<Cell> = self
            .cells
            .iter()
            .filter(|c| query.matches(c))
            .cloned()
            .collect();
        if let Some(rows) = query.rows {
            found.truncate(rows as usize);
        }
        Ok(found)
    }

    async fn get(&self, id: &str) -> Result<Option<Cell>, CatalogError> {
        Ok(self
            .cells
            .iter()
            .find(|c| cell_id(c) == Some(id))
            .cloned())
    }
}

// =============================================================================
// Financial year lookup
// =============================================================================

pub fn cell_id(cell: &Cell) -> Option<&str> {
    cell.get("id").and_then(Value::as_str)
}

/// Financial year carried by a dataset, top-level or in CKAN `extras`.
pub fn cell_financial_year(cell: &Cell) -> Option<FinancialYear> {
    if let Some(fy) = cell.get("financial_year").and_then(Value::as_str) {
        return fy.parse().ok();
    }
    cell.get("extras")?
        .as_array()?
        .iter()
        .find(|e| e.get("key").and_then(Value::as_str) == Some("financial_year"))
        .and_then(|e| e.get("value"))
        .and_then(Value::as_str)
        .and_then(|fy| fy.parse().ok())
}

/// Latest financial year the catalog publishes for a sphere.
///
/// Search results that omit the year are fetched in full by id.
pub async fn latest_financial_year<C: CatalogClient + ?Sized>(
    catalog: &C,
    sphere: Sphere,
) -> Result<Option<FinancialYear>, CatalogError> {
    let query = CatalogQuery::new()
        .filter("vocab_spheres", sphere.as_str())
        .sort("financial_year desc")
        .rows(50);

    let mut latest = None;
    for cell in catalog.search(&query).await? {
        let year = match cell_financial_year(&cell) {
            Some(fy) => Some(fy),
            None => match cell_id(&cell) {
                Some(id) => catalog.get(id).await?.as_ref().and_then(cell_financial_year),
                None => None,
            },
        };
        latest = latest.max(year);
    }

    Ok(latest)
}
