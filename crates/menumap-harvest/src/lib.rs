//! Harvest orchestration: hierarchy walker, deal reconciler, CSV export.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use menumap_core::{
    is_known_region, rebuild_keyed, CatalogTree, Deal, Listing, MenuItem, Subregion, REGION_SLUGS,
};
use menumap_store::{
    fetch_collection, CatalogEndpoints, ClientConfig, HttpTransport, Paginator, Transport,
    DEALS_QUERY, DEFAULT_PAGE_SIZE, DEFAULT_REQUEST_DELAY, LISTINGS_QUERY, MENU_ITEMS_QUERY,
    SUBREGIONS_FIELD,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "menumap-harvest";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub api_base: String,
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_delay_secs: u64,
    pub skip_pause_secs: u64,
    pub page_size: u32,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: std::env::var("MENUMAP_API_BASE")
                .unwrap_or_else(|_| "https://api.menumap.example".to_string()),
            data_dir: std::env::var("MENUMAP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            user_agent: std::env::var("MENUMAP_USER_AGENT")
                .unwrap_or_else(|_| "menumap-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("MENUMAP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            request_delay_secs: std::env::var("MENUMAP_REQUEST_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            skip_pause_secs: std::env::var("MENUMAP_SKIP_PAUSE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            page_size: std::env::var("MENUMAP_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PAGE_SIZE),
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.data_dir.join("exports")
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn endpoints(&self) -> CatalogEndpoints {
        CatalogEndpoints::new(self.api_base.clone(), self.page_size)
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            request_delay: Duration::from_secs(self.request_delay_secs),
            skip_pause: Duration::from_secs(self.skip_pause_secs),
        }
    }
}

/// The only scheduling primitives in the system: a fixed delay between
/// requests and a shorter breather after a skipped record.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub request_delay: Duration,
    pub skip_pause: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            request_delay: DEFAULT_REQUEST_DELAY,
            skip_pause: Duration::from_secs(2),
        }
    }
}

impl Pacing {
    pub const fn none() -> Self {
        Self {
            request_delay: Duration::ZERO,
            skip_pause: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestPlan {
    pub region: String,
    pub subregion: Option<String>,
    pub menus: bool,
    pub deals: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub region: String,
    pub subregions_discovered: usize,
    pub listings_merged: usize,
    pub menu_items_merged: usize,
    pub deals_merged: usize,
    pub units_failed: usize,
    pub records_skipped: usize,
}

/// Outcome of one traversal sweep: how many records landed, how many units
/// errored and were skipped over, how many units had nothing to do.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepTally {
    pub merged: usize,
    pub failed_units: usize,
    pub skipped_units: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DealTally {
    pub merged: usize,
    pub duplicates: usize,
    pub skipped_records: usize,
}

/// Walks the region enumeration and drives fetch+merge passes over the tree it
/// owns. Everything runs strictly sequentially; the tree is only ever mutated
/// by the unit currently in focus.
pub struct Harvester<T: Transport> {
    tree: CatalogTree,
    transport: T,
    endpoints: CatalogEndpoints,
    pacing: Pacing,
    records_skipped: usize,
}

impl Harvester<HttpTransport> {
    pub fn from_config(tree: CatalogTree, config: &HarvestConfig) -> anyhow::Result<Self> {
        let transport =
            HttpTransport::new(config.client_config()).context("building http transport")?;
        Ok(Self::new(tree, transport, config.endpoints(), config.pacing()))
    }
}

impl<T: Transport> Harvester<T> {
    pub fn new(tree: CatalogTree, transport: T, endpoints: CatalogEndpoints, pacing: Pacing) -> Self {
        Self {
            tree,
            transport,
            endpoints,
            pacing,
            records_skipped: 0,
        }
    }

    pub fn tree(&self) -> &CatalogTree {
        &self.tree
    }

    pub fn into_tree(self) -> CatalogTree {
        self.tree
    }

    async fn pause(&self) {
        if !self.pacing.request_delay.is_zero() {
            tokio::time::sleep(self.pacing.request_delay).await;
        }
    }

    async fn skip_pause(&self) {
        if !self.pacing.skip_pause.is_zero() {
            tokio::time::sleep(self.pacing.skip_pause).await;
        }
    }

    /// Fetch the subregions of one region and fold them into the region's map.
    /// Existing siblings survive; a re-discovered subregion is replaced whole,
    /// which resets its collections.
    pub async fn discover_subregions(&mut self, region: &str) -> anyhow::Result<usize> {
        anyhow::ensure!(
            is_known_region(region),
            "{region} is not a recognized region slug"
        );
        info!(region, "downloading subregions");
        let url = self.endpoints.subregions(region);
        let raw = fetch_collection(&self.transport, &url, SUBREGIONS_FIELD).await?;
        self.pause().await;

        let (records, malformed) = parse_records::<Subregion>(raw, "subregion");
        self.records_skipped += malformed;

        let subregions = self.tree.region_entry(region);
        let mut merged = 0usize;
        for mut subregion in records {
            subregion.region = region.to_string();
            subregions.insert(subregion.slug.clone(), subregion);
            merged += 1;
        }
        info!(region, merged, "subregions merged");
        Ok(merged)
    }

    /// Fetch every listing page for one subregion and replace its listings
    /// collection with the rebuilt, slug-keyed result.
    pub async fn fetch_listings(
        &mut self,
        region: &str,
        subregion_slug: &str,
    ) -> anyhow::Result<usize> {
        self.tree
            .subregion(region, subregion_slug)
            .with_context(|| format!("subregion {subregion_slug} not loaded under {region}"))?;

        info!(region, subregion = subregion_slug, "downloading listings");
        let paginator = Paginator::new(&self.transport, self.pacing.request_delay);
        let raw = paginator
            .fetch_all(LISTINGS_QUERY, |offset| {
                self.endpoints.listings(subregion_slug, offset)
            })
            .await?;
        self.pause().await;

        let (records, malformed) = parse_records::<Listing>(raw, "listing");
        self.records_skipped += malformed;
        let records: Vec<Listing> = records
            .into_iter()
            .map(|mut listing| {
                listing.region = Some(region.to_string());
                listing.subregion = Some(subregion_slug.to_string());
                listing
            })
            .collect();

        let (rebuilt, unkeyed) = rebuild_keyed(records, |listing| Some(listing.slug.as_str()));
        self.records_skipped += unkeyed;
        let merged = rebuilt.len();

        let subregion = self
            .tree
            .subregion_mut(region, subregion_slug)
            .with_context(|| format!("subregion {subregion_slug} vanished mid-merge"))?;
        subregion.listings = Some(rebuilt);
        info!(region, subregion = subregion_slug, merged, "listings merged");
        Ok(merged)
    }

    /// Fetch one listing's whole menu and replace any prior menu.
    pub async fn fetch_menu(
        &mut self,
        region: &str,
        subregion_slug: &str,
        listing_slug: &str,
    ) -> anyhow::Result<usize> {
        info!(
            region,
            subregion = subregion_slug,
            listing = listing_slug,
            "downloading menu"
        );
        let paginator = Paginator::new(&self.transport, self.pacing.request_delay);
        let raw = paginator
            .fetch_all(MENU_ITEMS_QUERY, |page| {
                self.endpoints.menu_items(listing_slug, page)
            })
            .await?;
        self.pause().await;

        let (records, malformed) = parse_records::<MenuItem>(raw, "menu_item");
        self.records_skipped += malformed;
        let records: Vec<MenuItem> = records
            .into_iter()
            .map(|mut item| {
                item.listing = Some(listing_slug.to_string());
                item
            })
            .collect();

        let (rebuilt, unkeyed) = rebuild_keyed(records, |item| Some(item.slug.as_str()));
        self.records_skipped += unkeyed;
        let merged = rebuilt.len();

        let listing = self
            .tree
            .subregion_mut(region, subregion_slug)
            .and_then(|subregion| subregion.listings.as_mut())
            .and_then(|listings| listings.get_mut(listing_slug))
            .with_context(|| {
                format!("listing {listing_slug} not loaded under {region}/{subregion_slug}")
            })?;
        listing.menu = Some(rebuilt);
        Ok(merged)
    }

    /// Listings pass over every subregion of one region. A unit that fails is
    /// logged and left at its last merged state; the sweep moves on.
    pub async fn fetch_region_listings(&mut self, region: &str) -> anyhow::Result<SweepTally> {
        let mut tally = SweepTally::default();
        let Some(subregions) = self.tree.region(region) else {
            debug!(region, "region not initialized; skipping");
            tally.skipped_units += 1;
            return Ok(tally);
        };
        let slugs: Vec<String> = subregions.keys().cloned().collect();
        for slug in slugs {
            match self.fetch_listings(region, &slug).await {
                Ok(merged) => tally.merged += merged,
                Err(err) => {
                    warn!(
                        region,
                        subregion = %slug,
                        error = %err,
                        "listings fetch failed; continuing with next subregion"
                    );
                    tally.failed_units += 1;
                }
            }
        }
        Ok(tally)
    }

    /// Listings pass over every region present in the tree.
    pub async fn fetch_all_listings(&mut self) -> anyhow::Result<SweepTally> {
        let mut tally = SweepTally::default();
        for region in REGION_SLUGS {
            if self.tree.region(region).is_none() {
                debug!(region, "region not initialized; skipping");
                continue;
            }
            let region_tally = self.fetch_region_listings(region).await?;
            tally.merged += region_tally.merged;
            tally.failed_units += region_tally.failed_units;
            tally.skipped_units += region_tally.skipped_units;
        }
        Ok(tally)
    }

    /// Menu pass over every listing of every loaded region. Subregions whose
    /// listings pass has not run yet are skipped with a diagnostic.
    pub async fn fetch_all_menus(&mut self) -> anyhow::Result<SweepTally> {
        let mut tally = SweepTally::default();
        for region in REGION_SLUGS {
            let Some(subregions) = self.tree.region(region) else {
                debug!(region, "region not initialized; skipping");
                continue;
            };
            let units: Vec<(String, Option<Vec<String>>)> = subregions
                .iter()
                .map(|(slug, subregion)| {
                    let listings = subregion
                        .listings
                        .as_ref()
                        .map(|listings| listings.keys().cloned().collect());
                    (slug.clone(), listings)
                })
                .collect();

            for (subregion_slug, listings) in units {
                let Some(listings) = listings else {
                    debug!(
                        region,
                        subregion = %subregion_slug,
                        "no listings loaded; skipping menus"
                    );
                    tally.skipped_units += 1;
                    continue;
                };
                for listing_slug in listings {
                    match self.fetch_menu(region, &subregion_slug, &listing_slug).await {
                        Ok(merged) => tally.merged += merged,
                        Err(err) => {
                            warn!(
                                region,
                                subregion = %subregion_slug,
                                listing = %listing_slug,
                                error = %err,
                                "menu fetch failed; continuing with next listing"
                            );
                            tally.failed_units += 1;
                        }
                    }
                }
            }
        }
        Ok(tally)
    }

    /// Deal pass over every region present in the tree. Transport failures
    /// abort the whole pass; corrupted records never do.
    pub async fn reconcile_deals(&mut self) -> anyhow::Result<DealTally> {
        let mut tally = DealTally::default();
        for region in self.tree.loaded_region_slugs() {
            let region_tally = self.reconcile_region_deals(&region).await?;
            tally.merged += region_tally.merged;
            tally.duplicates += region_tally.duplicates;
            tally.skipped_records += region_tally.skipped_records;
        }
        Ok(tally)
    }

    /// Deals are fetched per subregion but each record names the subregion it
    /// actually belongs to, so this runs as collect-then-redistribute: clear
    /// every participant, stage records under their true target with an
    /// identity-based dedup set per target, then rebuild each target keyed and
    /// sorted by slug.
    pub async fn reconcile_region_deals(&mut self, region: &str) -> anyhow::Result<DealTally> {
        let mut tally = DealTally::default();
        let Some(subregions) = self.tree.region_mut(region) else {
            debug!(region, "region not initialized; skipping deals");
            return Ok(tally);
        };
        info!(region, "reconciling deals");

        let participants: Vec<(String, u64)> = subregions
            .iter()
            .map(|(slug, subregion)| (slug.clone(), subregion.id))
            .collect();
        for subregion in subregions.values_mut() {
            subregion.deals = Some(BTreeMap::new());
        }

        let mut staged: BTreeMap<String, Vec<Deal>> = BTreeMap::new();
        let mut seen: BTreeMap<String, HashSet<u64>> = BTreeMap::new();

        for (fetched_from, subregion_id) in &participants {
            info!(region, subregion = %fetched_from, "downloading deals");
            let paginator = Paginator::new(&self.transport, self.pacing.request_delay);
            let raw = paginator
                .fetch_all(DEALS_QUERY, |offset| self.endpoints.deals(*subregion_id, offset))
                .await?;
            self.pause().await;

            for value in raw {
                let deal = match serde_json::from_value::<Deal>(value) {
                    Ok(deal) => deal,
                    Err(err) => {
                        warn!(
                            region,
                            subregion = %fetched_from,
                            error = %err,
                            "skipping corrupted deal record"
                        );
                        tally.skipped_records += 1;
                        self.skip_pause().await;
                        continue;
                    }
                };
                let Some(target) = deal.target_subregion().map(str::to_owned) else {
                    warn!(
                        region,
                        subregion = %fetched_from,
                        deal = %deal.slug,
                        "deal carries no target reference; skipping"
                    );
                    tally.skipped_records += 1;
                    self.skip_pause().await;
                    continue;
                };
                if self.tree.subregion(region, &target).is_none() {
                    warn!(
                        region,
                        target = %target,
                        deal = %deal.slug,
                        "deal targets an unknown subregion; skipping"
                    );
                    tally.skipped_records += 1;
                    self.skip_pause().await;
                    continue;
                }

                if !seen.entry(target.clone()).or_default().insert(deal.id) {
                    tally.duplicates += 1;
                    debug!(
                        region,
                        target = %target,
                        deal_id = deal.id,
                        "duplicate deal identity; keeping first sighting"
                    );
                    continue;
                }
                debug!(
                    region,
                    from = %fetched_from,
                    target = %target,
                    deal = %deal.slug,
                    "staged deal"
                );
                staged.entry(target).or_default().push(deal);
            }
        }

        for (target, deals) in staged {
            let (rebuilt, unkeyed) = rebuild_keyed(deals, |deal| Some(deal.slug.as_str()));
            tally.skipped_records += unkeyed;
            tally.merged += rebuilt.len();
            if let Some(subregion) = self.tree.subregion_mut(region, &target) {
                subregion.deals = Some(rebuilt);
            }
        }

        self.records_skipped += tally.skipped_records;
        info!(
            region,
            merged = tally.merged,
            duplicates = tally.duplicates,
            skipped = tally.skipped_records,
            "deals reconciled"
        );
        Ok(tally)
    }

    /// One full harvest run: discover the plan's region, merge listings for
    /// the selected subregion (or the whole region), then optionally sweep
    /// menus and reconcile deals tree-wide.
    pub async fn run(&mut self, plan: &HarvestPlan) -> anyhow::Result<HarvestReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let skipped_before = self.records_skipped;
        info!(%run_id, region = %plan.region, "starting harvest run");

        let subregions_discovered = self.discover_subregions(&plan.region).await?;

        let mut listings_merged = 0usize;
        let mut units_failed = 0usize;
        match &plan.subregion {
            Some(subregion) => {
                listings_merged += self.fetch_listings(&plan.region, subregion).await?;
            }
            None => {
                let tally = self.fetch_region_listings(&plan.region).await?;
                listings_merged += tally.merged;
                units_failed += tally.failed_units;
            }
        }

        let mut menu_items_merged = 0usize;
        if plan.menus {
            let tally = self.fetch_all_menus().await?;
            menu_items_merged = tally.merged;
            units_failed += tally.failed_units;
        }

        let mut deals_merged = 0usize;
        if plan.deals {
            let tally = self.reconcile_deals().await?;
            deals_merged = tally.merged;
        }

        let finished_at = Utc::now();
        Ok(HarvestReport {
            run_id,
            started_at,
            finished_at,
            region: plan.region.clone(),
            subregions_discovered,
            listings_merged,
            menu_items_merged,
            deals_merged,
            units_failed,
            records_skipped: self.records_skipped - skipped_before,
        })
    }
}

fn parse_records<R: DeserializeOwned>(raw: Vec<JsonValue>, kind: &'static str) -> (Vec<R>, usize) {
    let mut records = Vec::with_capacity(raw.len());
    let mut malformed = 0usize;
    for value in raw {
        match serde_json::from_value::<R>(value) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(kind, error = %err, "skipping malformed record");
                malformed += 1;
            }
        }
    }
    (records, malformed)
}

pub const LISTING_COLUMNS: &[&str] = &[
    "id",
    "name",
    "slug",
    "city",
    "type",
    "web_url",
    "ranking",
    "rating",
    "reviews_count",
    "has_sale_items",
    "address",
    "zip_code",
    "timezone",
    "open_now",
    "closes_in",
    "todays_hours_str",
    "menu_items_count",
    "verified_menu_items_count",
    "is_published",
    "email",
    "phone_number",
    "region",
    "subregion",
];

pub const MENU_COLUMNS: &[&str] = &[
    "id",
    "name",
    "slug",
    "category.name",
    "edge_category.name",
    "price.price",
    "price.unit",
    "price.label",
    "price.quantity",
    "reviews_count",
    "rating",
    "is_endorsed",
    "is_badged",
    "created_at",
    "listing",
];

pub const DEAL_COLUMNS: &[&str] = &[
    "id",
    "listing.slug",
    "listing.region.slug",
    "listing.web_url",
    "title",
    "body",
];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("column `{column}` missing from {entity} record `{key}`")]
    MissingColumn {
        entity: &'static str,
        key: String,
        column: &'static str,
    },
    #[error("serializing record for export: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("writing csv: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Resolve a dotted column path inside a serialized record.
fn column_value<'v>(record: &'v JsonValue, path: &str) -> Option<&'v JsonValue> {
    let mut current = record;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn cell(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn write_rows<W, S>(
    out: W,
    entity: &'static str,
    columns: &[&'static str],
    rows: impl IntoIterator<Item = (String, S)>,
) -> Result<usize, ExportError>
where
    W: Write,
    S: Serialize,
{
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(columns)?;
    let mut written = 0usize;
    for (key, record) in rows {
        let value = serde_json::to_value(&record)?;
        let mut cells = Vec::with_capacity(columns.len());
        for &column in columns {
            let Some(found) = column_value(&value, column) else {
                return Err(ExportError::MissingColumn {
                    entity,
                    key,
                    column,
                });
            };
            cells.push(cell(found));
        }
        writer.write_record(&cells)?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

/// Every listing of a subregion, one row per listing.
pub fn listings_csv<W: Write>(subregion: &Subregion, out: W) -> Result<usize, ExportError> {
    let rows = subregion
        .listings
        .iter()
        .flatten()
        .map(|(slug, listing)| (slug.clone(), listing));
    write_rows(out, "listing", LISTING_COLUMNS, rows)
}

/// One listing's menu, one row per item.
pub fn listing_menu_csv<W: Write>(listing: &Listing, out: W) -> Result<usize, ExportError> {
    let rows = listing
        .menu
        .iter()
        .flatten()
        .map(|(slug, item)| (slug.clone(), item));
    write_rows(out, "menu_item", MENU_COLUMNS, rows)
}

/// Every fetched menu item across a subregion's listings.
pub fn subregion_menus_csv<W: Write>(subregion: &Subregion, out: W) -> Result<usize, ExportError> {
    let rows = subregion
        .listings
        .iter()
        .flatten()
        .flat_map(|(_, listing)| listing.menu.iter().flatten())
        .map(|(slug, item)| (slug.clone(), item));
    write_rows(out, "menu_item", MENU_COLUMNS, rows)
}

/// Every deal of a subregion.
pub fn subregion_deals_csv<W: Write>(subregion: &Subregion, out: W) -> Result<usize, ExportError> {
    let rows = subregion
        .deals
        .iter()
        .flatten()
        .map(|(slug, deal)| (slug.clone(), deal));
    write_rows(out, "deal", DEAL_COLUMNS, rows)
}

/// Every deal across a region's subregions.
pub fn region_deals_csv<W: Write>(
    region: &BTreeMap<String, Subregion>,
    out: W,
) -> Result<usize, ExportError> {
    let rows = region
        .values()
        .flat_map(|subregion| subregion.deals.iter().flatten())
        .map(|(slug, deal)| (slug.clone(), deal));
    write_rows(out, "deal", DEAL_COLUMNS, rows)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub region: String,
    pub subregion: String,
    pub files: Vec<ExportedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

fn manifest_entry(name: &str, file_name: &str, bytes: &[u8], rows: usize) -> ExportedFile {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ExportedFile {
        name: name.to_string(),
        path: file_name.to_string(),
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
        rows,
    }
}

/// Write the standard export bundle for one selected subregion: its listings,
/// its menus, and every deal in its region, plus a manifest hashing each file.
pub fn export_bundle(
    tree: &CatalogTree,
    region: &str,
    subregion_slug: &str,
    dir: &Path,
    run_id: Uuid,
) -> anyhow::Result<ExportManifest> {
    let region_map = tree
        .region(region)
        .with_context(|| format!("region {region} not loaded"))?;
    let subregion = region_map
        .get(subregion_slug)
        .with_context(|| format!("subregion {subregion_slug} not loaded under {region}"))?;

    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating export directory {}", dir.display()))?;

    let mut files = Vec::new();
    let mut write_file = |name: &str,
                          file_name: &str,
                          render: &dyn Fn(&mut Vec<u8>) -> Result<usize, ExportError>|
     -> anyhow::Result<()> {
        let mut buffer = Vec::new();
        let rows = render(&mut buffer).with_context(|| format!("rendering {file_name}"))?;
        let path = dir.join(file_name);
        std::fs::write(&path, &buffer)
            .with_context(|| format!("writing {}", path.display()))?;
        files.push(manifest_entry(name, file_name, &buffer, rows));
        Ok(())
    };

    write_file("listings", "listings.csv", &|buffer| {
        listings_csv(subregion, buffer)
    })?;
    write_file("subregion_menus", "subregion_menus.csv", &|buffer| {
        subregion_menus_csv(subregion, buffer)
    })?;
    write_file("region_deals", "region_deals.csv", &|buffer| {
        region_deals_csv(region_map, buffer)
    })?;

    let manifest = ExportManifest {
        run_id,
        generated_at: Utc::now(),
        region: region.to_string(),
        subregion: subregion_slug.to_string(),
        files,
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(
        region,
        subregion = subregion_slug,
        dir = %dir.display(),
        "export bundle written"
    );
    Ok(manifest)
}
