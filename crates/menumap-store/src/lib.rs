//! Transport, paged fetch, and snapshot persistence for menumap.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use menumap_core::CatalogTree;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "menumap-store";

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_REQUEST_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_REQUESTS: u32 = 1000;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request for {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("decoding response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// The transport capability: a URL in, parsed JSON out. No retry lives here;
/// failures propagate unmodified to whoever drives the fetch.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<JsonValue, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_json(&self, url: &str) -> Result<JsonValue, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        response
            .json()
            .await
            .map_err(|source| TransportError::Decode {
                url: url.to_string(),
                source,
            })
    }
}

/// How a paged endpoint advances: listings and deals move an item offset,
/// menu items move a page index. The two are deliberately not unified beyond
/// this flag; their cursor arithmetic differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStyle {
    Offset,
    PageNumber,
}

/// Where a paged endpoint declares its total and carries its items.
#[derive(Debug, Clone, Copy)]
pub struct PagedQuery {
    pub style: PageStyle,
    pub total_field: &'static str,
    pub items_field: &'static str,
}

pub const LISTINGS_QUERY: PagedQuery = PagedQuery {
    style: PageStyle::Offset,
    total_field: "total_listings",
    items_field: "listings",
};

pub const MENU_ITEMS_QUERY: PagedQuery = PagedQuery {
    style: PageStyle::PageNumber,
    total_field: "total_menu_items",
    items_field: "menu_items",
};

pub const DEALS_QUERY: PagedQuery = PagedQuery {
    style: PageStyle::Offset,
    total_field: "total_deals",
    items_field: "deals",
};

/// Subregion discovery is a single unpaged request.
pub const SUBREGIONS_FIELD: &str = "subregions";

#[derive(Debug, Clone)]
pub struct CatalogEndpoints {
    base: String,
    page_size: u32,
}

impl CatalogEndpoints {
    pub fn new(base: impl Into<String>, page_size: u32) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Self { base, page_size }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn subregions(&self, region_slug: &str) -> String {
        format!("{}/v1/regions/{}/subregions", self.base, region_slug)
    }

    pub fn listings(&self, subregion_slug: &str, offset: u64) -> String {
        format!(
            "{}/v1/listings?offset={}&page_size={}&filter[region_slug]={}",
            self.base, offset, self.page_size, subregion_slug
        )
    }

    pub fn menu_items(&self, listing_slug: &str, page: u64) -> String {
        format!(
            "{}/v1/listings/{}/menu_items?page_size={}&page={}",
            self.base, listing_slug, self.page_size, page
        )
    }

    pub fn deals(&self, subregion_id: u64, offset: u64) -> String {
        format!(
            "{}/v1/deals?filter[region_id]={}&page_size={}&offset={}",
            self.base, subregion_id, self.page_size, offset
        )
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("response from {url} is missing `{field}`")]
    MissingField { url: String, field: String },
    #[error("pagination for {url} stalled after {requests} requests ({accumulated} of {total} items)")]
    Stalled {
        url: String,
        requests: u32,
        accumulated: usize,
        total: u64,
    },
}

/// Drives one paged endpoint until its declared total is satisfied.
///
/// The total is latched from the first response and later totals are ignored.
/// A fixed delay is honored before every request after the first. The upstream
/// offers no guarantee that pages ever sum to the declared total, so a request
/// cap and an empty-page check turn that case into a hard `Stalled` failure
/// instead of an unbounded loop.
pub struct Paginator<'a, T: Transport + ?Sized> {
    transport: &'a T,
    delay: Duration,
    max_requests: u32,
}

impl<'a, T: Transport + ?Sized> Paginator<'a, T> {
    pub fn new(transport: &'a T, delay: Duration) -> Self {
        Self {
            transport,
            delay,
            max_requests: DEFAULT_MAX_REQUESTS,
        }
    }

    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub async fn fetch_all<F>(
        &self,
        query: PagedQuery,
        url_for: F,
    ) -> Result<Vec<JsonValue>, FetchError>
    where
        F: Fn(u64) -> String,
    {
        let mut cursor: u64 = match query.style {
            PageStyle::Offset => 0,
            PageStyle::PageNumber => 1,
        };
        let mut accumulated: Vec<JsonValue> = Vec::new();
        let mut declared_total: Option<u64> = None;
        let mut requests: u32 = 0;
        let mut last_url = String::new();

        while requests < self.max_requests {
            if requests > 0 {
                tokio::time::sleep(self.delay).await;
            }

            let url = url_for(cursor);
            let mut body = self.transport.get_json(&url).await?;
            requests += 1;

            let total = match declared_total {
                Some(total) => total,
                None => {
                    let total = read_meta_total(&body, &url, query.total_field)?;
                    declared_total = Some(total);
                    total
                }
            };

            if total == 0 {
                debug!(%url, "declared total is zero; nothing to accumulate");
                return Ok(accumulated);
            }

            let page = take_data_items(&mut body, &url, query.items_field)?;
            let received = page.len();
            accumulated.extend(page);
            debug!(
                %url,
                received,
                accumulated = accumulated.len(),
                total,
                "merged page"
            );

            if accumulated.len() as u64 >= total {
                return Ok(accumulated);
            }
            if received == 0 {
                // An empty page with the total unmet can never converge.
                return Err(FetchError::Stalled {
                    url,
                    requests,
                    accumulated: accumulated.len(),
                    total,
                });
            }

            cursor += match query.style {
                PageStyle::Offset => received as u64,
                PageStyle::PageNumber => 1,
            };
            last_url = url;
        }

        Err(FetchError::Stalled {
            url: last_url,
            requests,
            accumulated: accumulated.len(),
            total: declared_total.unwrap_or(0),
        })
    }
}

/// One unpaged request returning the array at `data.<items_field>`.
pub async fn fetch_collection<T: Transport + ?Sized>(
    transport: &T,
    url: &str,
    items_field: &str,
) -> Result<Vec<JsonValue>, FetchError> {
    let mut body = transport.get_json(url).await?;
    take_data_items(&mut body, url, items_field)
}

fn read_meta_total(body: &JsonValue, url: &str, field: &str) -> Result<u64, FetchError> {
    body.get("meta")
        .and_then(|meta| meta.get(field))
        .and_then(JsonValue::as_u64)
        .ok_or_else(|| FetchError::MissingField {
            url: url.to_string(),
            field: format!("meta.{field}"),
        })
}

fn take_data_items(
    body: &mut JsonValue,
    url: &str,
    field: &str,
) -> Result<Vec<JsonValue>, FetchError> {
    match body
        .get_mut("data")
        .and_then(|data| data.get_mut(field))
        .map(JsonValue::take)
    {
        Some(JsonValue::Array(items)) => Ok(items),
        _ => Err(FetchError::MissingField {
            url: url.to_string(),
            field: format!("data.{field}"),
        }),
    }
}

/// Load a tree snapshot. A missing file means "start empty"; anything else is
/// an error worth surfacing.
pub async fn load_tree(path: &Path) -> anyhow::Result<CatalogTree> {
    match fs::read(path).await {
        Ok(bytes) => {
            let tree: CatalogTree = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing snapshot {}", path.display()))?;
            info!(path = %path.display(), "loaded catalog snapshot");
            Ok(tree)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no snapshot found; starting empty");
            Ok(CatalogTree::new())
        }
        Err(err) => {
            Err(err).with_context(|| format!("reading snapshot {}", path.display()))
        }
    }
}

/// Save the tree via a temp file and atomic rename so a crash mid-write never
/// leaves a torn snapshot behind.
pub async fn save_tree(path: &Path, tree: &CatalogTree) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(tree).context("serializing catalog tree")?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn transport() -> HttpTransport {
        HttpTransport::new(ClientConfig::default()).expect("client")
    }

    fn numbered_items(range: std::ops::Range<u64>) -> Vec<JsonValue> {
        range.map(|n| json!({ "slug": format!("item-{n}") })).collect()
    }

    #[test]
    fn endpoint_urls_carry_cursor_and_page_size() {
        let endpoints = CatalogEndpoints::new("https://catalog.example/", 100);
        assert_eq!(
            endpoints.subregions("oklahoma"),
            "https://catalog.example/v1/regions/oklahoma/subregions"
        );
        assert_eq!(
            endpoints.listings("oklahoma-city", 200),
            "https://catalog.example/v1/listings?offset=200&page_size=100&filter[region_slug]=oklahoma-city"
        );
        assert_eq!(
            endpoints.menu_items("green-door", 3),
            "https://catalog.example/v1/listings/green-door/menu_items?page_size=100&page=3"
        );
        assert_eq!(
            endpoints.deals(77, 100),
            "https://catalog.example/v1/deals?filter[region_id]=77&page_size=100&offset=100"
        );
    }

    #[tokio::test]
    async fn offset_pagination_terminates_on_declared_total() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(GET).path("/v1/listings").query_param("offset", "0");
            then.status(200).json_body(json!({
                "meta": { "total_listings": 150 },
                "data": { "listings": numbered_items(0..100) }
            }));
        });
        let second = server.mock(|when, then| {
            when.method(GET).path("/v1/listings").query_param("offset", "100");
            then.status(200).json_body(json!({
                "meta": { "total_listings": 150 },
                "data": { "listings": numbered_items(100..150) }
            }));
        });

        let endpoints = CatalogEndpoints::new(server.base_url(), 100);
        let transport = transport();
        let paginator = Paginator::new(&transport, Duration::ZERO);
        let items = paginator
            .fetch_all(LISTINGS_QUERY, |offset| endpoints.listings("oklahoma-city", offset))
            .await
            .unwrap();

        first.assert();
        second.assert();
        assert_eq!(items.len(), 150);
        assert_eq!(items[0]["slug"], json!("item-0"));
        assert_eq!(items[149]["slug"], json!("item-149"));
    }

    #[tokio::test]
    async fn zero_total_short_circuits_after_one_request() {
        let server = MockServer::start();
        let only = server.mock(|when, then| {
            when.method(GET).path("/v1/listings");
            then.status(200).json_body(json!({
                "meta": { "total_listings": 0 },
                "data": { "listings": [] }
            }));
        });

        let endpoints = CatalogEndpoints::new(server.base_url(), 100);
        let transport = transport();
        let paginator = Paginator::new(&transport, Duration::ZERO);
        let items = paginator
            .fetch_all(LISTINGS_QUERY, |offset| endpoints.listings("nowhere", offset))
            .await
            .unwrap();

        only.assert_hits(1);
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn page_number_pagination_advances_by_one() {
        let server = MockServer::start();
        let pages: Vec<_> = (1u64..=3)
            .map(|page| {
                let lo = (page - 1) * 100;
                let hi = (lo + 100).min(250);
                server.mock(move |when, then| {
                    when.method(GET)
                        .path("/v1/listings/green-door/menu_items")
                        .query_param("page", page.to_string());
                    then.status(200).json_body(json!({
                        "meta": { "total_menu_items": 250 },
                        "data": { "menu_items": numbered_items(lo..hi) }
                    }));
                })
            })
            .collect();

        let endpoints = CatalogEndpoints::new(server.base_url(), 100);
        let transport = transport();
        let paginator = Paginator::new(&transport, Duration::ZERO);
        let items = paginator
            .fetch_all(MENU_ITEMS_QUERY, |page| endpoints.menu_items("green-door", page))
            .await
            .unwrap();

        for page in &pages {
            page.assert();
        }
        assert_eq!(items.len(), 250);
        assert_eq!(items[249]["slug"], json!("item-249"));
    }

    #[tokio::test]
    async fn empty_page_with_unmet_total_is_a_hard_stall() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/listings");
            then.status(200).json_body(json!({
                "meta": { "total_listings": 50 },
                "data": { "listings": [] }
            }));
        });

        let endpoints = CatalogEndpoints::new(server.base_url(), 100);
        let transport = transport();
        let paginator = Paginator::new(&transport, Duration::ZERO);
        let err = paginator
            .fetch_all(LISTINGS_QUERY, |offset| endpoints.listings("oklahoma-city", offset))
            .await
            .unwrap_err();

        match err {
            FetchError::Stalled {
                requests,
                accumulated,
                total,
                ..
            } => {
                assert_eq!(requests, 1);
                assert_eq!(accumulated, 0);
                assert_eq!(total, 50);
            }
            other => panic!("expected Stalled, got {other}"),
        }
    }

    #[tokio::test]
    async fn request_cap_stops_a_total_that_never_converges() {
        let server = MockServer::start();
        // Every page repeats the same single item against a total of 1000, so
        // the running sum can never reach it within the cap.
        server.mock(|when, then| {
            when.method(GET).path("/v1/listings");
            then.status(200).json_body(json!({
                "meta": { "total_listings": 1000 },
                "data": { "listings": numbered_items(0..1) }
            }));
        });

        let endpoints = CatalogEndpoints::new(server.base_url(), 100);
        let transport = transport();
        let paginator = Paginator::new(&transport, Duration::ZERO).with_max_requests(5);
        let err = paginator
            .fetch_all(LISTINGS_QUERY, |offset| endpoints.listings("oklahoma-city", offset))
            .await
            .unwrap_err();

        match err {
            FetchError::Stalled { requests, accumulated, .. } => {
                assert_eq!(requests, 5);
                assert_eq!(accumulated, 5);
            }
            other => panic!("expected Stalled, got {other}"),
        }
    }

    #[tokio::test]
    async fn missing_declared_total_is_reported_by_field() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/listings");
            then.status(200)
                .json_body(json!({ "data": { "listings": [] } }));
        });

        let endpoints = CatalogEndpoints::new(server.base_url(), 100);
        let transport = transport();
        let paginator = Paginator::new(&transport, Duration::ZERO);
        let err = paginator
            .fetch_all(LISTINGS_QUERY, |offset| endpoints.listings("oklahoma-city", offset))
            .await
            .unwrap_err();

        match err {
            FetchError::MissingField { field, .. } => {
                assert_eq!(field, "meta.total_listings");
            }
            other => panic!("expected MissingField, got {other}"),
        }
    }

    #[tokio::test]
    async fn transport_status_failures_propagate_unmodified() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/listings");
            then.status(503);
        });

        let endpoints = CatalogEndpoints::new(server.base_url(), 100);
        let transport = transport();
        let paginator = Paginator::new(&transport, Duration::ZERO);
        let err = paginator
            .fetch_all(LISTINGS_QUERY, |offset| endpoints.listings("oklahoma-city", offset))
            .await
            .unwrap_err();

        match err {
            FetchError::Transport(TransportError::Status { status, .. }) => {
                assert_eq!(status, 503);
            }
            other => panic!("expected transport status error, got {other}"),
        }
    }

    #[tokio::test]
    async fn collection_fetch_returns_the_named_array() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/regions/oklahoma/subregions");
            then.status(200).json_body(json!({
                "data": { "subregions": [
                    { "id": 10, "slug": "oklahoma-city" },
                    { "id": 11, "slug": "tulsa" }
                ] }
            }));
        });

        let endpoints = CatalogEndpoints::new(server.base_url(), 100);
        let transport = transport();
        let items = fetch_collection(&transport, &endpoints.subregions("oklahoma"), SUBREGIONS_FIELD)
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["slug"], json!("tulsa"));
    }

    #[tokio::test]
    async fn snapshot_round_trips_and_missing_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");

        let empty = load_tree(&path).await.unwrap();
        assert!(empty.is_empty());

        let mut tree = CatalogTree::new();
        tree.region_entry("oklahoma");
        save_tree(&path, &tree).await.unwrap();

        let restored = load_tree(&path).await.unwrap();
        assert_eq!(restored, tree);
        // No temp files left behind.
        let stray: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(stray.is_empty());
    }

    #[tokio::test]
    async fn saving_over_an_existing_snapshot_replaces_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");

        let mut first = CatalogTree::new();
        first.region_entry("oklahoma");
        save_tree(&path, &first).await.unwrap();

        let mut second = CatalogTree::new();
        second.region_entry("texas");
        save_tree(&path, &second).await.unwrap();

        let restored = load_tree(&path).await.unwrap();
        assert_eq!(restored, second);
    }
}
