//! Catalog discovery, metric page and lot page adapters for the storefront's HTML.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotwatch_core::{
    parse_counter_value, CatalogEntry, Entry, EntryId, MetricSet, Offer, RunId, SubEntry,
};
use lotwatch_storage::{ArtifactStore, FetchError, HttpFetcher, Url};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "lotwatch-adapters";

const ENTRY_BLOCK: &str = "div.promo-game-item";
const ENTRY_TITLE: &str = "div.game-title";
const LINK: &str = "a[href]";
const SUB_ENTRY_ITEM: &str = "ul.list-inline li";
const COUNTER_LIST: &str = "div.counter-list";
const COUNTER_ITEM: &str = "a.counter-item";
const COUNTER_PARAM: &str = ".counter-param";
const COUNTER_VALUE: &str = ".counter-value";
const OFFER_ITEM: &str = "a.tc-item";
const OFFER_SELLER: &str = ".media-user-name";
const OFFER_DESCRIPTION: &str = ".tc-desc-text";
const OFFER_PRICE: &str = ".tc-price";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid base url `{0}`")]
    BaseUrl(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AdapterError {
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Fetch(err) => err.kind(),
            AdapterError::Selector { .. } => "selector_error",
            AdapterError::BaseUrl(_) => "config_error",
            AdapterError::Io { .. } => "io_error",
        }
    }
}

/// Produces the catalog of entries (with their lots) for one run.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn describe(&self) -> String;

    async fn discover(&self, run: &RunId) -> Result<Vec<CatalogEntry>, AdapterError>;
}

/// Fetches the counter set of a single entry page.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn fetch_metrics(&self, url: &str) -> Result<MetricSet, AdapterError>;
}

/// Fetches the offers listed on one lot page.
#[async_trait]
pub trait OfferSource: Send + Sync {
    async fn fetch_offers(&self, lot: &SubEntry) -> Result<Vec<Offer>, AdapterError>;
}

fn selector(raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Selector {
        selector: raw.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(node: ElementRef<'_>) -> Option<String> {
    text_or_none(node.text().collect::<String>())
}

fn first_href(node: ElementRef<'_>, link: &Selector) -> Option<String> {
    node.select(link)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| text_or_none(href.to_string()))
}

pub fn parse_base_url(raw: &str) -> Result<Url, AdapterError> {
    Url::parse(raw).map_err(|_| AdapterError::BaseUrl(raw.to_string()))
}

/// Resolves `href` against the site origin; absolute links pass through.
pub fn absolutize(base: &Url, href: &str) -> Option<String> {
    base.join(href.trim()).ok().map(|u| u.to_string())
}

/// Parses the catalog page into entries. Blocks missing an id, title or link are skipped.
pub fn parse_catalog(html: &str, base: &Url) -> Result<Vec<CatalogEntry>, AdapterError> {
    let block_sel = selector(ENTRY_BLOCK)?;
    let title_sel = selector(ENTRY_TITLE)?;
    let link_sel = selector(LINK)?;
    let lot_sel = selector(SUB_ENTRY_ITEM)?;

    let document = Html::parse_document(html);
    let mut out = Vec::new();
    let mut skipped = 0usize;

    for block in document.select(&block_sel) {
        let Some(title_node) = block.select(&title_sel).next() else {
            skipped += 1;
            continue;
        };
        let id = match title_node.value().attr("data-id").map(str::parse::<EntryId>) {
            Some(Ok(id)) => id,
            _ => {
                warn!(data_id = ?title_node.value().attr("data-id"), "catalog block without usable id");
                skipped += 1;
                continue;
            }
        };
        let Some(title) = element_text(title_node) else {
            warn!(entry_id = %id, "catalog block without title");
            skipped += 1;
            continue;
        };
        let Some(url) = first_href(title_node, &link_sel).and_then(|h| absolutize(base, &h)) else {
            warn!(entry_id = %id, "catalog block without link");
            skipped += 1;
            continue;
        };

        let sub_entries = block
            .select(&lot_sel)
            .filter_map(|li| {
                let name = element_text(li)?;
                let url = first_href(li, &link_sel).and_then(|h| absolutize(base, &h))?;
                Some(SubEntry {
                    name,
                    url,
                    parent_entry_id: id,
                })
            })
            .collect();

        out.push(CatalogEntry {
            entry: Entry::new(id, url, title),
            sub_entries,
        });
    }

    if out.is_empty() && skipped == 0 {
        warn!("catalog page has no entry blocks; treating as empty");
    }
    debug!(entries = out.len(), skipped, "parsed catalog");
    Ok(out)
}

/// Parses the counter container of an entry page. No container yields an empty set.
pub fn parse_counters(html: &str) -> Result<MetricSet, AdapterError> {
    let list_sel = selector(COUNTER_LIST)?;
    let item_sel = selector(COUNTER_ITEM)?;
    let param_sel = selector(COUNTER_PARAM)?;
    let value_sel = selector(COUNTER_VALUE)?;

    let document = Html::parse_document(html);
    let mut metrics = MetricSet::new();
    let Some(list) = document.select(&list_sel).next() else {
        debug!("no counter container on page");
        return Ok(metrics);
    };

    for item in list.select(&item_sel) {
        let label = item.select(&param_sel).next().and_then(element_text);
        let raw_value = item.select(&value_sel).next().and_then(element_text);
        let (Some(label), Some(raw_value)) = (label, raw_value) else {
            continue;
        };
        let Some(value) = parse_counter_value(&raw_value) else {
            warn!(label = %label, raw_value = %raw_value, "counter value is not a non-negative integer");
            continue;
        };
        match metrics.insert_label(&label, value) {
            Ok(None) => {}
            Ok(Some(conflict)) => warn!(error_kind = "schema_conflict", %conflict, "counter labels collide"),
            Err(err) => warn!(%err, "dropping counter label"),
        }
    }
    Ok(metrics)
}

/// Parses the offer rows of a lot page. Rows without a description are skipped.
pub fn parse_offers(
    html: &str,
    base: &Url,
    entry_id: EntryId,
    observed_at: DateTime<Utc>,
) -> Result<Vec<Offer>, AdapterError> {
    let item_sel = selector(OFFER_ITEM)?;
    let seller_sel = selector(OFFER_SELLER)?;
    let desc_sel = selector(OFFER_DESCRIPTION)?;
    let price_sel = selector(OFFER_PRICE)?;

    let document = Html::parse_document(html);
    let mut offers = Vec::new();
    for item in document.select(&item_sel) {
        let Some(description) = item.select(&desc_sel).next().and_then(element_text) else {
            warn!(entry_id = %entry_id, "offer row without description");
            continue;
        };
        offers.push(Offer {
            entry_id,
            seller: item.select(&seller_sel).next().and_then(element_text),
            description,
            price: item.select(&price_sel).next().and_then(element_text),
            link: item
                .value()
                .attr("href")
                .and_then(|href| absolutize(base, href)),
            observed_at,
        });
    }
    debug!(entry_id = %entry_id, offers = offers.len(), "parsed lot page");
    Ok(offers)
}

/// Live catalog fetched once per run. The raw page is kept as a run artifact when a store is set.
pub struct HttpCatalogSource {
    http: Arc<HttpFetcher>,
    catalog_url: String,
    base: Url,
    artifacts: Option<ArtifactStore>,
}

impl HttpCatalogSource {
    pub fn new(http: Arc<HttpFetcher>, catalog_url: impl Into<String>, base: Url) -> Self {
        Self {
            http,
            catalog_url: catalog_url.into(),
            base,
            artifacts: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    fn describe(&self) -> String {
        self.catalog_url.clone()
    }

    async fn discover(&self, run: &RunId) -> Result<Vec<CatalogEntry>, AdapterError> {
        let resp = self.http.fetch_once(&self.catalog_url).await?;
        if let Some(store) = &self.artifacts {
            match store.store_bytes(run, "catalog", "html", &resp.body).await {
                Ok(stored) => info!(
                    run_id = %run,
                    path = %stored.relative_path.display(),
                    deduplicated = stored.deduplicated,
                    "catalog page archived"
                ),
                Err(err) => warn!(run_id = %run, error = %format!("{err:#}"), "failed to archive catalog page"),
            }
        }
        let html = String::from_utf8_lossy(&resp.body);
        parse_catalog(&html, &self.base)
    }
}

/// Catalog read from a saved copy of the storefront page.
pub struct FileCatalogSource {
    path: PathBuf,
    base: Url,
}

impl FileCatalogSource {
    pub fn new(path: impl Into<PathBuf>, base: Url) -> Self {
        Self {
            path: path.into(),
            base,
        }
    }
}

#[async_trait]
impl CatalogSource for FileCatalogSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn discover(&self, _run: &RunId) -> Result<Vec<CatalogEntry>, AdapterError> {
        let html = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AdapterError::Io {
                path: self.path.clone(),
                source,
            })?;
        parse_catalog(&html, &self.base)
    }
}

/// Entry pages fetched with the rate-limit retry policy of [`HttpFetcher::fetch_with_retry`].
pub struct HtmlMetricSource {
    http: Arc<HttpFetcher>,
}

impl HtmlMetricSource {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl MetricSource for HtmlMetricSource {
    async fn fetch_metrics(&self, url: &str) -> Result<MetricSet, AdapterError> {
        let resp = self.http.fetch_with_retry(url).await?;
        let html = String::from_utf8_lossy(&resp.body);
        parse_counters(&html)
    }
}

/// Lot pages fetched with the same retry policy as entry pages.
pub struct HtmlOfferSource {
    http: Arc<HttpFetcher>,
    base: Url,
}

impl HtmlOfferSource {
    pub fn new(http: Arc<HttpFetcher>, base: Url) -> Self {
        Self { http, base }
    }
}

#[async_trait]
impl OfferSource for HtmlOfferSource {
    async fn fetch_offers(&self, lot: &SubEntry) -> Result<Vec<Offer>, AdapterError> {
        let resp = self.http.fetch_with_retry(&lot.url).await?;
        let html = String::from_utf8_lossy(&resp.body);
        parse_offers(&html, &self.base, lot.parent_entry_id, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use lotwatch_storage::HttpClientConfig;

    const CATALOG: &str = r#"
        <html><body>
          <div class="promo-game-item">
            <div class="game-title" data-id="2866"><a href="/en/lots/2866/">Albion Online</a></div>
            <ul class="list-inline">
              <li><a href="/en/lots/2867/">Silver</a></li>
              <li><a href="https://funpay.com/en/lots/2868/">Accounts</a></li>
              <li>No link here</li>
            </ul>
          </div>
          <div class="promo-game-item">
            <div class="game-title" data-id="77"><a href="https://funpay.com/en/lots/77/">Apex Legends</a></div>
          </div>
          <div class="promo-game-item">
            <div class="game-title"><a href="/en/lots/1/">Missing id</a></div>
          </div>
          <div class="promo-game-item">
            <div class="game-title" data-id="abc"><a href="/en/lots/2/">Bad id</a></div>
          </div>
        </body></html>
    "#;

    const COUNTERS: &str = r#"
        <div class="counter-list counter-list-circles">
          <a class="counter-item" href="/en/lots/2866/">
            <div class="inside">
              <div class="counter-param">Accounts</div>
              <div class="counter-value">1 204</div>
            </div>
          </a>
          <a class="counter-item"><div class="inside">
            <div class="counter-param">Top-up</div><div class="counter-value">17</div>
          </div></a>
          <a class="counter-item"><div class="inside">
            <div class="counter-param">Top up</div><div class="counter-value">20</div>
          </div></a>
          <a class="counter-item"><div class="inside">
            <div class="counter-param">Items</div><div class="counter-value">soon</div>
          </div></a>
          <a class="counter-item"><div class="inside">
            <div class="counter-param">???</div><div class="counter-value">3</div>
          </div></a>
        </div>
    "#;

    const LOT_PAGE: &str = r#"
        <div class="tc table-hover">
          <a href="https://funpay.com/en/lots/offer?id=101" class="tc-item">
            <div class="tc-server">EU</div>
            <div class="tc-desc"><div class="tc-desc-text">Level 80 account, full access</div></div>
            <div class="tc-user"><div class="media-user-name"> trader42 </div></div>
            <div class="tc-price">12.50 $</div>
          </a>
          <a href="/en/lots/offer?id=102" class="tc-item">
            <div class="tc-desc"><div class="tc-desc-text">1000 silver</div></div>
          </a>
          <a href="/en/lots/offer?id=103" class="tc-item">
            <div class="tc-price">3 $</div>
          </a>
        </div>
    "#;

    fn base() -> Url {
        parse_base_url("https://funpay.com").expect("base")
    }

    #[test]
    fn catalog_blocks_become_entries_with_absolute_urls() {
        let entries = parse_catalog(CATALOG, &base()).expect("parse");
        assert_eq!(entries.len(), 2);

        let albion = &entries[0];
        assert_eq!(albion.entry.id, EntryId(2866));
        assert_eq!(albion.entry.title, "Albion Online");
        assert_eq!(albion.entry.url, "https://funpay.com/en/lots/2866/");
        assert!(albion.entry.metrics.is_empty());
        let lots: Vec<_> = albion
            .sub_entries
            .iter()
            .map(|s| (s.name.as_str(), s.url.as_str(), s.parent_entry_id))
            .collect();
        assert_eq!(
            lots,
            vec![
                ("Silver", "https://funpay.com/en/lots/2867/", EntryId(2866)),
                ("Accounts", "https://funpay.com/en/lots/2868/", EntryId(2866)),
            ]
        );

        assert_eq!(entries[1].entry.id, EntryId(77));
        assert!(entries[1].sub_entries.is_empty());
    }

    #[test]
    fn page_without_entry_blocks_is_empty_not_an_error() {
        let entries = parse_catalog("<html><body><h1>Maintenance</h1></body></html>", &base())
            .expect("parse");
        assert!(entries.is_empty());
    }

    #[test]
    fn counters_are_sanitized_once_and_collisions_keep_last_value() {
        let metrics = parse_counters(COUNTERS).expect("parse");
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics.get("Accounts"), Some(1204));
        assert_eq!(metrics.get("Topup"), Some(20));
        assert_eq!(metrics.get("Items"), None);
    }

    #[test]
    fn page_without_counter_container_yields_empty_set() {
        let metrics = parse_counters("<div class=\"tc-item\">offer</div>").expect("parse");
        assert!(metrics.is_empty());
    }

    #[test]
    fn lot_page_rows_become_offers() {
        let observed = Utc::now();
        let offers = parse_offers(LOT_PAGE, &base(), EntryId(2866), observed).expect("parse");
        assert_eq!(offers.len(), 2);

        assert_eq!(offers[0].entry_id, EntryId(2866));
        assert_eq!(offers[0].seller.as_deref(), Some("trader42"));
        assert_eq!(offers[0].description, "Level 80 account, full access");
        assert_eq!(offers[0].price.as_deref(), Some("12.50 $"));
        assert_eq!(
            offers[0].link.as_deref(),
            Some("https://funpay.com/en/lots/offer?id=101")
        );
        assert_eq!(offers[0].observed_at, observed);

        assert_eq!(offers[1].seller, None);
        assert_eq!(offers[1].price, None);
        assert_eq!(
            offers[1].link.as_deref(),
            Some("https://funpay.com/en/lots/offer?id=102")
        );
    }

    #[test]
    fn relative_links_resolve_against_origin() {
        assert_eq!(
            absolutize(&base(), "/en/lots/5/").as_deref(),
            Some("https://funpay.com/en/lots/5/")
        );
        assert_eq!(
            absolutize(&base(), "https://example.org/x").as_deref(),
            Some("https://example.org/x")
        );
    }

    #[tokio::test]
    async fn saved_catalog_file_is_discovered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.html");
        std::fs::write(&path, CATALOG).expect("write");

        let source = FileCatalogSource::new(&path, base());
        let run = RunId::parse("20260224_120000").expect("run");
        let entries = source.discover(&run).await.expect("discover");
        assert_eq!(entries.len(), 2);

        let missing = FileCatalogSource::new(dir.path().join("nope.html"), base());
        let err = missing.discover(&run).await.expect_err("missing file");
        assert_eq!(err.kind(), "io_error");
    }

    #[tokio::test]
    async fn html_metric_source_fetches_and_parses_entry_page() {
        let app = Router::new().route("/en/lots/2866/", get(|| async { COUNTERS }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http"));
        let source = HtmlMetricSource::new(http);
        let metrics = source
            .fetch_metrics(&format!("http://{addr}/en/lots/2866/"))
            .await
            .expect("metrics");
        assert_eq!(metrics.get("accounts"), Some(1204));

        let err = source
            .fetch_metrics(&format!("http://{addr}/en/lots/404/"))
            .await
            .expect_err("404");
        assert_eq!(err.kind(), "fetch_error");
    }

    #[tokio::test]
    async fn html_offer_source_tags_offers_with_parent_entry() {
        let app = Router::new().route("/en/lots/2867/", get(|| async { LOT_PAGE }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http"));
        let source = HtmlOfferSource::new(http, base());
        let lot = SubEntry {
            name: "Silver".into(),
            url: format!("http://{addr}/en/lots/2867/"),
            parent_entry_id: EntryId(2866),
        };
        let offers = source.fetch_offers(&lot).await.expect("offers");
        assert_eq!(offers.len(), 2);
        assert!(offers.iter().all(|o| o.entry_id == EntryId(2866)));
    }

    #[tokio::test]
    async fn live_catalog_is_archived_per_run() {
        let app = Router::new().route("/en/", get(|| async { CATALOG }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http"));
        let source = HttpCatalogSource::new(http, format!("http://{addr}/en/"), base())
            .with_artifacts(ArtifactStore::new(dir.path()));
        let run = RunId::parse("20260224_120000").expect("run");

        let entries = source.discover(&run).await.expect("discover");
        assert_eq!(entries.len(), 2);
        let archived = std::fs::read_dir(dir.path().join("20260224_120000").join("catalog"))
            .expect("artifact dir")
            .count();
        assert_eq!(archived, 1);
    }
}
