//! Core domain model and keyed merge store for menumap.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::warn;

pub const CRATE_NAME: &str = "menumap-core";

/// The closed set of region slugs the catalog publishes. A region absent from
/// the tree means "not yet fetched", never "invalid".
pub const REGION_SLUGS: &[&str] = &[
    "alabama",
    "alaska",
    "arizona",
    "arkansas",
    "california",
    "colorado",
    "connecticut",
    "delaware",
    "florida",
    "georgia",
    "hawaii",
    "idaho",
    "illinois",
    "indiana",
    "iowa",
    "kansas",
    "kentucky",
    "louisiana",
    "maine",
    "maryland",
    "massachusetts",
    "michigan",
    "minnesota",
    "mississippi",
    "missouri",
    "montana",
    "nebraska",
    "nevada",
    "new-hampshire",
    "new-jersey",
    "new-mexico",
    "new-york",
    "north-carolina",
    "north-dakota",
    "ohio",
    "oklahoma",
    "oregon",
    "pennsylvania",
    "rhode-island",
    "south-carolina",
    "south-dakota",
    "tennessee",
    "texas",
    "utah",
    "vermont",
    "virginia",
    "washington",
    "washington-dc",
    "west-virginia",
    "wisconsin",
    "wyoming",
];

pub fn is_known_region(slug: &str) -> bool {
    REGION_SLUGS.contains(&slug)
}

/// A subregion as fetched from region discovery. `region` is the owning region
/// slug, stamped at discovery; `listings` and `deals` stay `None` until their
/// fetch passes run. Unmodeled upstream attributes ride along in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subregion {
    pub id: u64,
    pub slug: String,
    #[serde(default)]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listings: Option<BTreeMap<String, Listing>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deals: Option<BTreeMap<String, Deal>>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

/// A storefront listing. Immutable once fetched except `menu`, which a later
/// pass populates. Back-references are slugs, never live references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: u64,
    pub slug: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub subregion: Option<String>,
    #[serde(default)]
    pub menu_items_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub menu: Option<BTreeMap<String, MenuItem>>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub slug: String,
    /// Owning listing slug, stamped when the menu is merged.
    #[serde(default)]
    pub listing: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

/// A deal. `id` is the numeric identity used for deduplication; `slug` is the
/// storage key. The embedded `listing.region.slug` names the subregion the deal
/// actually belongs to, which can differ from the subregion it was fetched from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: u64,
    pub slug: String,
    #[serde(default)]
    pub listing: Option<DealListing>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealListing {
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub region: Option<DealRegion>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRegion {
    pub slug: String,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl Deal {
    /// The subregion slug this deal actually applies to, if the record carries
    /// a resolvable reference.
    pub fn target_subregion(&self) -> Option<&str> {
        self.listing
            .as_ref()?
            .region
            .as_ref()
            .map(|region| region.slug.as_str())
    }
}

/// The whole harvested hierarchy: region slug → subregion slug → subregion.
/// `BTreeMap` keeps every level iterating in lexicographic key order, which is
/// the ordering guarantee the merge contract promises. The tree has a single
/// owner (the harvester); everything else borrows it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogTree {
    regions: BTreeMap<String, BTreeMap<String, Subregion>>,
}

impl CatalogTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Regions that have been fetched so far, in slug order.
    pub fn regions(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, Subregion>)> {
        self.regions.iter()
    }

    pub fn loaded_region_slugs(&self) -> Vec<String> {
        self.regions.keys().cloned().collect()
    }

    pub fn region(&self, region: &str) -> Option<&BTreeMap<String, Subregion>> {
        self.regions.get(region)
    }

    pub fn region_mut(&mut self, region: &str) -> Option<&mut BTreeMap<String, Subregion>> {
        self.regions.get_mut(region)
    }

    /// The region's subregion map, created empty if the region has never been
    /// fetched. Callers must have validated the slug against `REGION_SLUGS`.
    pub fn region_entry(&mut self, region: &str) -> &mut BTreeMap<String, Subregion> {
        self.regions.entry(region.to_string()).or_default()
    }

    pub fn subregion(&self, region: &str, subregion: &str) -> Option<&Subregion> {
        self.regions.get(region)?.get(subregion)
    }

    pub fn subregion_mut(&mut self, region: &str, subregion: &str) -> Option<&mut Subregion> {
        self.regions.get_mut(region)?.get_mut(subregion)
    }
}

/// Rebuild a child collection from a record batch: a fresh map keyed by each
/// record's own slug, the last record winning on a repeated key. Records whose
/// key selector yields nothing are dropped and counted; the caller decides how
/// loudly to report them. The returned map iterates in ascending key order.
pub fn rebuild_keyed<T, F>(records: Vec<T>, key_of: F) -> (BTreeMap<String, T>, usize)
where
    F: Fn(&T) -> Option<&str>,
{
    let mut rebuilt = BTreeMap::new();
    let mut skipped = 0usize;
    for record in records {
        match key_of(&record).map(str::to_owned) {
            Some(key) => {
                rebuilt.insert(key, record);
            }
            None => skipped += 1,
        }
    }
    (rebuilt, skipped)
}

/// Cursor over the tree for downstream consumers. Holds keys, not references;
/// every accessor re-resolves against the borrowed tree so a stale selection
/// simply resolves to `None`. Failed selections leave the cursor unchanged.
#[derive(Debug, Clone, Default)]
pub struct SelectionCursor {
    region: Option<String>,
    subregion: Option<String>,
    listing: Option<String>,
}

impl SelectionCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select_region(&mut self, tree: &CatalogTree, slug: &str) -> bool {
        if tree.region(slug).is_none() {
            warn!(region = slug, "region not loaded; refresh region data and retry");
            return false;
        }
        self.region = Some(slug.to_string());
        self.subregion = None;
        self.listing = None;
        true
    }

    pub fn select_subregion(&mut self, tree: &CatalogTree, slug: &str) -> bool {
        let Some(region) = self.region.as_deref() else {
            warn!("select a region before selecting a subregion");
            return false;
        };
        if tree.subregion(region, slug).is_none() {
            warn!(subregion = slug, "subregion not loaded; refresh subregions and retry");
            return false;
        }
        self.subregion = Some(slug.to_string());
        self.listing = None;
        true
    }

    pub fn select_listing(&mut self, tree: &CatalogTree, slug: &str) -> bool {
        let Some(subregion) = self.subregion(tree) else {
            warn!("select a subregion before selecting a listing");
            return false;
        };
        let loaded = subregion
            .listings
            .as_ref()
            .is_some_and(|listings| listings.contains_key(slug));
        if !loaded {
            warn!(listing = slug, "listing not loaded; refresh listings and retry");
            return false;
        }
        self.listing = Some(slug.to_string());
        true
    }

    pub fn region<'t>(&self, tree: &'t CatalogTree) -> Option<&'t BTreeMap<String, Subregion>> {
        tree.region(self.region.as_deref()?)
    }

    pub fn subregion<'t>(&self, tree: &'t CatalogTree) -> Option<&'t Subregion> {
        tree.subregion(self.region.as_deref()?, self.subregion.as_deref()?)
    }

    pub fn listing<'t>(&self, tree: &'t CatalogTree) -> Option<&'t Listing> {
        self.subregion(tree)?
            .listings
            .as_ref()?
            .get(self.listing.as_deref()?)
    }

    /// The selected listing's menu. `None` both when nothing is selected and
    /// when the menu pass has not run for the listing yet.
    pub fn menu<'t>(&self, tree: &'t CatalogTree) -> Option<&'t BTreeMap<String, MenuItem>> {
        self.listing(tree)?.menu.as_ref()
    }

    pub fn region_slug(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn subregion_slug(&self) -> Option<&str> {
        self.subregion.as_deref()
    }

    pub fn listing_slug(&self) -> Option<&str> {
        self.listing.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subregion(slug: &str, id: u64) -> Subregion {
        Subregion {
            id,
            slug: slug.to_string(),
            region: "oklahoma".to_string(),
            listings: None,
            deals: None,
            extra: JsonMap::new(),
        }
    }

    fn listing(slug: &str) -> Listing {
        Listing {
            id: 1,
            slug: slug.to_string(),
            name: None,
            region: None,
            subregion: None,
            menu_items_count: None,
            menu: None,
            extra: JsonMap::new(),
        }
    }

    #[test]
    fn rebuild_orders_lexicographically_regardless_of_input_order() {
        let records = vec![listing("c"), listing("a"), listing("b")];
        let (rebuilt, skipped) = rebuild_keyed(records, |l| Some(l.slug.as_str()));
        assert_eq!(skipped, 0);
        let keys: Vec<&str> = rebuilt.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn rebuild_keeps_last_record_for_repeated_key() {
        let mut first_a = listing("a");
        first_a.name = Some("first".to_string());
        let mut second_a = listing("a");
        second_a.name = Some("second".to_string());
        let records = vec![listing("z"), first_a, second_a];

        let (rebuilt, _) = rebuild_keyed(records, |l| Some(l.slug.as_str()));

        assert_eq!(rebuilt.len(), 2);
        let keys: Vec<&str> = rebuilt.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a", "z"]);
        assert_eq!(rebuilt["a"].name.as_deref(), Some("second"));
    }

    #[test]
    fn rebuild_is_idempotent() {
        // A merge is a full replace-and-rebuild, so applying the same batch to
        // a node twice must leave exactly what applying it once leaves.
        let batch = || vec![listing("c"), listing("a"), listing("a"), listing("b")];
        let (once, _) = rebuild_keyed(batch(), |l| Some(l.slug.as_str()));
        let (twice, _) = rebuild_keyed(batch(), |l| Some(l.slug.as_str()));
        assert_eq!(once, twice);
        assert_eq!(
            once.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn rebuild_counts_records_without_a_key() {
        let records = vec![Some("a"), None, Some("b"), None];
        let (rebuilt, skipped) = rebuild_keyed(records, |r| *r);
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(skipped, 2);
    }

    #[test]
    fn traversing_the_enumeration_tolerates_a_mostly_empty_tree() {
        let mut tree = CatalogTree::new();
        tree.region_entry("oklahoma")
            .insert("oklahoma-city".to_string(), subregion("oklahoma-city", 10));

        let mut visited = Vec::new();
        for region in REGION_SLUGS {
            let Some(subregions) = tree.region(region) else {
                continue;
            };
            visited.extend(subregions.keys().cloned());
        }
        assert_eq!(visited, vec!["oklahoma-city".to_string()]);
    }

    #[test]
    fn region_enumeration_is_closed_and_sorted() {
        assert_eq!(REGION_SLUGS.len(), 51);
        assert!(REGION_SLUGS.windows(2).all(|w| w[0] < w[1]));
        assert!(is_known_region("oklahoma"));
        assert!(!is_known_region("atlantis"));
    }

    #[test]
    fn deal_record_parses_with_nested_target_reference() {
        let raw = json!({
            "id": 42,
            "slug": "two-for-one",
            "title": "Two for one",
            "body": "All week",
            "listing": {
                "slug": "green-door",
                "web_url": "https://catalog.example/green-door",
                "region": { "slug": "edmond", "name": "Edmond" }
            }
        });
        let deal: Deal = serde_json::from_value(raw).unwrap();
        assert_eq!(deal.id, 42);
        assert_eq!(deal.target_subregion(), Some("edmond"));
        assert_eq!(deal.extra["title"], json!("Two for one"));
    }

    #[test]
    fn tree_snapshot_shape_is_flat_and_round_trips() {
        let mut tree = CatalogTree::new();
        let mut sub = subregion("oklahoma-city", 10);
        sub.extra
            .insert("name".to_string(), json!("Oklahoma City"));
        tree.region_entry("oklahoma")
            .insert("oklahoma-city".to_string(), sub);

        let value = serde_json::to_value(&tree).unwrap();
        assert_eq!(value["oklahoma"]["oklahoma-city"]["name"], json!("Oklahoma City"));
        assert_eq!(value["oklahoma"]["oklahoma-city"]["id"], json!(10));

        let restored: CatalogTree = serde_json::from_value(value).unwrap();
        assert_eq!(restored, tree);
    }

    #[test]
    fn cursor_rejects_unknown_keys_and_keeps_prior_selection() {
        let mut tree = CatalogTree::new();
        tree.region_entry("oklahoma")
            .insert("oklahoma-city".to_string(), subregion("oklahoma-city", 10));

        let mut cursor = SelectionCursor::new();
        assert!(!cursor.select_region(&tree, "texas"));
        assert!(cursor.region(&tree).is_none());

        assert!(cursor.select_region(&tree, "oklahoma"));
        assert!(!cursor.select_subregion(&tree, "tulsa"));
        assert_eq!(cursor.region_slug(), Some("oklahoma"));
        assert!(cursor.subregion_slug().is_none());

        assert!(cursor.select_subregion(&tree, "oklahoma-city"));
        assert_eq!(cursor.subregion(&tree).unwrap().id, 10);
    }

    #[test]
    fn cursor_requires_shallower_levels_first() {
        let tree = CatalogTree::new();
        let mut cursor = SelectionCursor::new();
        assert!(!cursor.select_subregion(&tree, "oklahoma-city"));
        assert!(!cursor.select_listing(&tree, "green-door"));
    }

    #[test]
    fn cursor_resolves_listing_and_menu_once_loaded() {
        let mut tree = CatalogTree::new();
        let mut sub = subregion("oklahoma-city", 10);
        let mut green = listing("green-door");
        green.menu = Some(BTreeMap::from([(
            "og-kush".to_string(),
            MenuItem {
                slug: "og-kush".to_string(),
                listing: Some("green-door".to_string()),
                extra: JsonMap::new(),
            },
        )]));
        sub.listings = Some(BTreeMap::from([
            ("green-door".to_string(), green),
            ("herbology".to_string(), listing("herbology")),
        ]));
        tree.region_entry("oklahoma")
            .insert("oklahoma-city".to_string(), sub);

        let mut cursor = SelectionCursor::new();
        assert!(cursor.select_region(&tree, "oklahoma"));
        assert!(cursor.select_subregion(&tree, "oklahoma-city"));
        assert!(cursor.select_listing(&tree, "green-door"));
        assert_eq!(cursor.menu(&tree).unwrap().len(), 1);

        // A listing without a fetched menu resolves to no menu, not an error.
        assert!(cursor.select_listing(&tree, "herbology"));
        assert_eq!(cursor.listing_slug(), Some("herbology"));
        assert!(cursor.menu(&tree).is_none());
    }
}
