//! Scene search against STAC item catalogs.
//!
//! [`StacCatalog`] talks to a STAC API `/search` endpoint over blocking HTTP and
//! converts returned items into [`Scene`] descriptors. [`StaticCatalog`] applies
//! the same query semantics to a fixed list of scenes, for offline runs and tests.

use crate::types::{BoundingBox, EoError, EoResult, Scene};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Search parameters for a catalog query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogQuery {
    /// Search area in geographic coordinates (lon/lat)
    pub bbox: BoundingBox,
    /// `"YYYY-MM-DD/YYYY-MM-DD"`, a single date, or an open range using `..`
    pub datetime: String,
    pub collection: String,
    /// Keep only scenes with cloud cover strictly below this percentage
    pub max_cloud_cover: Option<f64>,
    /// Page size requested from the server
    pub limit: u32,
}

impl CatalogQuery {
    pub fn new(bbox: BoundingBox, datetime: &str, collection: &str) -> Self {
        Self {
            bbox,
            datetime: datetime.to_string(),
            collection: collection.to_string(),
            max_cloud_cover: None,
            limit: 100,
        }
    }

    pub fn with_max_cloud_cover(mut self, percent: f64) -> Self {
        self.max_cloud_cover = Some(percent);
        self
    }

    /// Inclusive calendar-day range. `None` on either side means unbounded.
    pub fn date_range(&self) -> EoResult<(Option<NaiveDate>, Option<NaiveDate>)> {
        parse_date_range(&self.datetime)
    }

    /// Whether a scene satisfies the bbox, date and cloud filters
    pub fn matches(&self, scene: &Scene) -> EoResult<bool> {
        if scene.collection != self.collection {
            return Ok(false);
        }
        if !self.bbox.intersects(&scene.footprint) {
            return Ok(false);
        }
        let (start, end) = self.date_range()?;
        let date = scene.date();
        if start.map_or(false, |s| date < s) || end.map_or(false, |e| date > e) {
            return Ok(false);
        }
        if let Some(max) = self.max_cloud_cover {
            // scenes without a cloud estimate cannot satisfy a cloud filter
            match scene.cloud_cover {
                Some(cc) if cc < max => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// RFC 3339 interval for the STAC `datetime` parameter
    fn stac_datetime(&self) -> EoResult<String> {
        let (start, end) = self.date_range()?;
        let start = start
            .map(|d| format!("{}T00:00:00Z", d.format("%Y-%m-%d")))
            .unwrap_or_else(|| "..".to_string());
        let end = end
            .map(|d| format!("{}T23:59:59Z", d.format("%Y-%m-%d")))
            .unwrap_or_else(|| "..".to_string());
        Ok(format!("{}/{}", start, end))
    }
}

/// Parse `"2020-01-01/2020-12-31"`, `"2020-06-01"`, `"../2020-12-31"` or a year `"2020"`
pub fn parse_date_range(s: &str) -> EoResult<(Option<NaiveDate>, Option<NaiveDate>)> {
    let parse_one = |part: &str, end: bool| -> EoResult<Option<NaiveDate>> {
        let part = part.trim();
        if part.is_empty() || part == ".." {
            return Ok(None);
        }
        if let Ok(date) = NaiveDate::parse_from_str(part, "%Y-%m-%d") {
            return Ok(Some(date));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(part) {
            return Ok(Some(dt.with_timezone(&Utc).date_naive()));
        }
        if let Ok(year) = part.parse::<i32>() {
            let (m, d) = if end { (12, 31) } else { (1, 1) };
            if let Some(date) = NaiveDate::from_ymd_opt(year, m, d) {
                return Ok(Some(date));
            }
        }
        Err(EoError::InvalidInput(format!("cannot parse date '{}'", part)))
    };

    match s.split_once('/') {
        Some((a, b)) => {
            let start = parse_one(a, false)?;
            let end = parse_one(b, true)?;
            if let (Some(s0), Some(e0)) = (start, end) {
                if s0 > e0 {
                    return Err(EoError::InvalidInput(format!(
                        "date range '{}' ends before it starts",
                        s
                    )));
                }
            }
            Ok((start, end))
        }
        None => Ok((parse_one(s, false)?, parse_one(s, true)?)),
    }
}

/// Anything that can answer a scene search
pub trait Catalog {
    fn search(&self, query: &CatalogQuery) -> EoResult<Vec<Scene>>;
}

/// Sort scenes into the stable output order (acquisition time, then id)
fn sort_scenes(scenes: &mut [Scene]) {
    scenes.sort_by(|a, b| a.datetime.cmp(&b.datetime).then_with(|| a.id.cmp(&b.id)));
}

/// In-memory catalog over a fixed scene list
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    scenes: Vec<Scene>,
}

impl StaticCatalog {
    pub fn new(scenes: Vec<Scene>) -> Self {
        Self { scenes }
    }
}

impl Catalog for StaticCatalog {
    fn search(&self, query: &CatalogQuery) -> EoResult<Vec<Scene>> {
        if !self.scenes.iter().any(|s| s.collection == query.collection) {
            return Err(EoError::Catalog(format!(
                "unknown collection '{}'",
                query.collection
            )));
        }
        let mut found = Vec::new();
        for scene in &self.scenes {
            if query.matches(scene)? {
                found.push(scene.clone());
            }
        }
        sort_scenes(&mut found);
        log::info!("Static catalog matched {} of {} scenes", found.len(), self.scenes.len());
        Ok(found)
    }
}

/// Well-known STAC APIs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StacEndpoint {
    /// AWS Earth Search (Element 84)
    EarthSearch,
    /// Microsoft Planetary Computer
    PlanetaryComputer,
    /// Digital Earth Africa
    DigitalEarthAfrica,
    /// Any STAC API root URL
    Custom(String),
}

impl StacEndpoint {
    pub fn root_url(&self) -> String {
        match self {
            Self::EarthSearch => "https://earth-search.aws.element84.com/v1".to_string(),
            Self::PlanetaryComputer => {
                "https://planetarycomputer.microsoft.com/api/stac/v1".to_string()
            }
            Self::DigitalEarthAfrica => "https://explorer.digitalearth.africa/stac".to_string(),
            Self::Custom(url) => url
                .trim_end_matches('/')
                .trim_end_matches("/search")
                .to_string(),
        }
    }

    pub fn search_url(&self) -> String {
        format!("{}/search", self.root_url())
    }

    pub fn collection_url(&self, collection: &str) -> String {
        format!("{}/collections/{}", self.root_url(), collection)
    }

    /// Shorthands `es`, `pc`, `deafrica`; anything else is a custom URL
    pub fn from_str_or_url(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "es" | "earth-search" | "earthsearch" => Self::EarthSearch,
            "pc" | "planetary-computer" | "planetarycomputer" => Self::PlanetaryComputer,
            "deafrica" | "de-africa" | "digitalearthafrica" => Self::DigitalEarthAfrica,
            _ => Self::Custom(s.to_string()),
        }
    }
}

/// Options for [`StacCatalog`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacOptions {
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Stop paginating after this many items
    pub max_items: usize,
    /// Check the collection exists before searching
    pub verify_collection: bool,
}

impl Default for StacOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            max_items: 500,
            verify_collection: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SearchBody {
    bbox: [f64; 4],
    datetime: String,
    collections: Vec<String>,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ItemCollection {
    #[serde(default)]
    features: Vec<Item>,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Clone, Deserialize)]
struct Item {
    id: String,
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    bbox: Option<Vec<f64>>,
    properties: ItemProperties,
    #[serde(default)]
    assets: HashMap<String, ItemAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct ItemProperties {
    #[serde(default)]
    datetime: Option<String>,
    #[serde(rename = "eo:cloud_cover", default)]
    cloud_cover: Option<f64>,
    #[serde(default)]
    platform: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ItemAsset {
    href: String,
}

/// Pagination link
#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub merge: Option<bool>,
}

fn parse_item_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn item_to_scene(item: Item, default_collection: &str) -> Option<Scene> {
    let datetime = match item.properties.datetime.as_deref().and_then(parse_item_datetime) {
        Some(dt) => dt,
        None => {
            log::warn!("Skipping item {}: missing or unparseable datetime", item.id);
            return None;
        }
    };
    let footprint = match item.bbox.as_deref().and_then(BoundingBox::from_stac) {
        Some(bbox) => bbox,
        None => {
            log::warn!("Skipping item {}: missing bbox", item.id);
            return None;
        }
    };
    let assets: BTreeMap<String, String> = item
        .assets
        .into_iter()
        .map(|(band, asset)| (band, asset.href))
        .collect();

    Some(Scene {
        id: item.id,
        collection: item
            .collection
            .unwrap_or_else(|| default_collection.to_string()),
        datetime,
        footprint,
        cloud_cover: item.properties.cloud_cover,
        platform: item.properties.platform,
        assets,
    })
}

/// Parse one page of a STAC item search response into scenes plus the
/// `next` link, if the server offered one.
pub fn parse_item_collection(
    body: &str,
    default_collection: &str,
) -> EoResult<(Vec<Scene>, Option<Link>)> {
    let page: ItemCollection = serde_json::from_str(body)
        .map_err(|e| EoError::Catalog(format!("malformed STAC response: {}", e)))?;
    let next = page.links.into_iter().find(|l| l.rel == "next");
    let scenes = page
        .features
        .into_iter()
        .filter_map(|item| item_to_scene(item, default_collection))
        .collect();
    Ok((scenes, next))
}

/// Longest wait between two request attempts
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Exponential backoff before `attempt` (1-based): 500 ms doubling, capped
fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_millis(500u64.saturating_mul(factor).min(MAX_RETRY_DELAY_MS))
}

/// Blocking STAC API client
pub struct StacCatalog {
    endpoint: StacEndpoint,
    client: reqwest::blocking::Client,
    options: StacOptions,
}

impl StacCatalog {
    pub fn new(endpoint: StacEndpoint, options: StacOptions) -> EoResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(options.timeout_secs))
            .build()
            .map_err(|e| EoError::Catalog(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            endpoint,
            client,
            options,
        })
    }

    pub fn endpoint(&self) -> &StacEndpoint {
        &self.endpoint
    }

    fn search_body(&self, query: &CatalogQuery) -> EoResult<SearchBody> {
        let cloud_filter = query
            .max_cloud_cover
            .map(|max| serde_json::json!({ "eo:cloud_cover": { "lt": max } }));
        Ok(SearchBody {
            bbox: query.bbox.to_stac(),
            datetime: query.stac_datetime()?,
            collections: vec![query.collection.clone()],
            limit: query.limit,
            query: cloud_filter,
            token: None,
        })
    }

    fn verify_collection(&self, collection: &str) -> EoResult<()> {
        let url = self.endpoint.collection_url(collection);
        log::debug!("Checking collection: {}", url);
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| EoError::Catalog(format!("catalog unreachable at {}: {}", url, e)))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(EoError::Catalog(format!("unknown collection '{}'", collection)));
        }
        if !status.is_success() {
            return Err(EoError::Catalog(format!(
                "collection lookup returned HTTP {}",
                status
            )));
        }
        Ok(())
    }

    /// Send one request with retries on transport errors and 5xx responses
    fn send_with_retry(
        &self,
        make_request: impl Fn() -> reqwest::blocking::RequestBuilder,
    ) -> EoResult<String> {
        let mut last_err = None;

        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                let delay = retry_delay(attempt);
                log::debug!("Retrying catalog request in {:?} (attempt {})", delay, attempt + 1);
                std::thread::sleep(delay);
            }

            match make_request().send() {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .text()
                        .map_err(|e| EoError::Catalog(format!("reading response body: {}", e)));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().unwrap_or_default();
                    last_err = Some(EoError::Catalog(format!(
                        "STAC search returned HTTP {}: {}",
                        status,
                        body.chars().take(300).collect::<String>()
                    )));
                    if status.is_client_error() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("Catalog request failed: {}", e);
                    last_err = Some(EoError::Catalog(format!("catalog unreachable: {}", e)));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| EoError::Catalog("STAC search failed".to_string())))
    }

    fn fetch_next(&self, link: &Link, previous: &SearchBody) -> EoResult<String> {
        let method = link.method.as_deref().unwrap_or("GET").to_uppercase();
        if method == "POST" {
            let mut body = serde_json::to_value(previous)?;
            match (&link.body, link.merge.unwrap_or(false)) {
                (Some(link_body), true) => {
                    if let (Some(base), Some(extra)) = (body.as_object_mut(), link_body.as_object()) {
                        for (k, v) in extra {
                            base.insert(k.clone(), v.clone());
                        }
                    }
                }
                (Some(link_body), false) => body = link_body.clone(),
                (None, _) => {}
            }
            self.send_with_retry(|| self.client.post(&link.href).json(&body))
        } else {
            self.send_with_retry(|| self.client.get(&link.href))
        }
    }
}

impl Catalog for StacCatalog {
    fn search(&self, query: &CatalogQuery) -> EoResult<Vec<Scene>> {
        log::info!(
            "Searching {} for '{}' in {:?} over {}",
            self.endpoint.root_url(),
            query.collection,
            query.bbox.to_stac(),
            query.datetime
        );

        if self.options.verify_collection {
            self.verify_collection(&query.collection)?;
        }

        let body = self.search_body(query)?;
        let url = self.endpoint.search_url();
        let mut text = self.send_with_retry(|| self.client.post(&url).json(&body))?;
        let mut scenes = Vec::new();

        loop {
            let (page, next) = parse_item_collection(&text, &query.collection)?;
            let page_len = page.len();
            scenes.extend(page);
            log::debug!("Fetched page of {} items ({} total)", page_len, scenes.len());

            if scenes.len() >= self.options.max_items || page_len == 0 {
                break;
            }
            match next {
                Some(link) => text = self.fetch_next(&link, &body)?,
                None => break,
            }
        }

        scenes.truncate(self.options.max_items);
        // servers that ignore the query extension still get filtered here
        if let Some(max) = query.max_cloud_cover {
            scenes.retain(|s| s.cloud_cover.map_or(false, |cc| cc < max));
        }
        sort_scenes(&mut scenes);
        log::info!("Catalog search returned {} scenes", scenes.len());
        Ok(scenes)
    }
}
