use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{error, info};
use url::form_urlencoded;

use crate::cooldown::CooldownRegistry;
use crate::http_client::{looks_like_block_page, FetchClientPool};
use crate::model::Item;
use crate::normalize::{abs_url, clean_title, first_http_url, first_price, img_url, normalize_price, stable_item_id};

use super::SourceAdapter;

pub const NAME: &str = "market.yandex.ru";
pub const SORT: &str = "aprice";
pub const MAX_PAGES: u32 = 10;

static SNIPPET_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[data-auto='snippet-link']").unwrap());
static SNIPPET_TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("[data-auto='snippet-title']").unwrap());
static ITEMPROP_NAME: Lazy<Selector> = Lazy::new(|| Selector::parse("[itemprop='name']").unwrap());
static PRICE_CURRENT: Lazy<Selector> =
    Lazy::new(|| Selector::parse("[data-auto='snippet-price-current']").unwrap());
static PRICE_PREFIX: Lazy<Selector> = Lazy::new(|| Selector::parse("[data-auto^='snippet-price']").unwrap());
static PICTURE_IMG: Lazy<Selector> = Lazy::new(|| Selector::parse("picture img").unwrap());
static IMG: Lazy<Selector> = Lazy::new(|| Selector::parse("img").unwrap());
static LD_JSON: Lazy<Selector> = Lazy::new(|| Selector::parse("script[type='application/ld+json']").unwrap());
static PRODUCT_ANCHOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("a[href*='/product--'], a[href*='/product/'], a[href*='/card/']").unwrap()
});
static NEXT_DATA_SCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<script[^>]+id="__NEXT_DATA__"[^>]*>(.*?)</script>"#).unwrap());
static PAGE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bстраниц[аы]\b").unwrap());
static PID_CARD: Lazy<Regex> = Lazy::new(|| Regex::new(r"/card/[^/]+/(\d+)").unwrap());
static PID_PRODUCT_DASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"/product--[^/]+/(\d+)").unwrap());
static PID_PRODUCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/product/(\d+)").unwrap());

const BASE_URL: &str = "https://market.yandex.ru";

/// The one adapter the orchestrator drives incrementally, page by page, via
/// `parse_html`. All other adapters are opaque behind `search`.
pub struct YandexAdapter {
    fetch: Arc<FetchClientPool>,
    cooldowns: Arc<CooldownRegistry>,
}

impl YandexAdapter {
    pub fn new(fetch: Arc<FetchClientPool>, cooldowns: Arc<CooldownRegistry>) -> Self {
        Self { fetch, cooldowns }
    }

    /// Builds the page-1 search URL, used both by `search` and by the
    /// orchestrator's incremental filler (which appends `page`/`rs` itself).
    pub fn search_url(query: &str, page: u32, rs: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(query.as_bytes()).collect();
        let mut url = format!(
            "{}/search?text={}&page={}&rt=9&how={}",
            BASE_URL, encoded, page, SORT
        );
        if !rs.is_empty() {
            let rs_encoded: String = form_urlencoded::byte_serialize(rs.as_bytes()).collect();
            url.push_str(&format!("&rs={}", rs_encoded));
        }
        url
    }

    /// Extracts the `rs` continuation token from a final (post-redirect)
    /// URL's query string, if present.
    pub fn extract_rs(final_url: &str) -> Option<String> {
        let parsed = url::Url::parse(final_url).ok()?;
        parsed
            .query_pairs()
            .find(|(k, _)| k == "rs")
            .map(|(_, v)| v.into_owned())
    }

    /// Parses a single search results page into up to `limit` items, trying
    /// the stable `data-auto` DOM markup first, then JSON-LD, then the
    /// `__NEXT_DATA__` payload, then a bare anchor-href heuristic.
    pub fn parse_html(&self, html: &str, limit: usize) -> Vec<Item> {
        let document = Html::parse_document(html);

        let primary = parse_snippet_links(&document, limit);
        if !primary.is_empty() {
            return primary;
        }

        let ld = parse_json_ld(&document, limit);
        if !ld.is_empty() {
            return ld;
        }

        let next_data = parse_next_data(html, limit);
        if !next_data.is_empty() {
            return next_data;
        }

        parse_generic_anchors(&document, limit)
    }
}

#[async_trait]
impl SourceAdapter for YandexAdapter {
    fn name(&self) -> &str {
        NAME
    }

    async fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<Item>> {
        if self.cooldowns.active(NAME) {
            return Ok(Vec::new());
        }
        let url = Self::search_url(query, 1, "");
        let result = self.fetch.get(NAME, &url).await;
        if result.html.is_empty() {
            error!("{}: fetch failed: {}", NAME, result.error.as_deref().unwrap_or("unknown"));
            return Ok(Vec::new());
        }
        if looks_like_block_page(&result.title, &result.html) {
            self.cooldowns.set(NAME, 15.0 * 60.0, "block-page");
            return Ok(Vec::new());
        }
        let items = self.parse_html(&result.html, limit);
        if !items.is_empty() {
            info!("{}: parsed {} items (title={:?})", NAME, items.len(), result.title);
        } else {
            error!(
                "{}: parsed 0 items (title={:?}, final_url={:?}, status={})",
                NAME, result.title, result.final_url, result.status
            );
        }
        Ok(items)
    }
}

fn yandex_pid_from_url(product_url: &str) -> String {
    if product_url.is_empty() {
        return String::new();
    }
    let path = url::Url::parse(product_url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| product_url.to_string());

    for pattern in [&*PID_CARD, &*PID_PRODUCT_DASH, &*PID_PRODUCT] {
        if let Some(caps) = pattern.captures(&path) {
            return caps[1].to_string();
        }
    }

    if let Ok(parsed) = url::Url::parse(product_url) {
        for key in ["sku", "productId", "modelId", "waremd5", "do-waremd5"] {
            if let Some((_, v)) = parsed.query_pairs().find(|(k, _)| k == key) {
                return v.into_owned();
            }
        }
    }

    stable_item_id(product_url)
}

fn looks_like_page_noise(title: &str) -> bool {
    let lower = title.to_lowercase();
    lower.contains("купить") || PAGE_WORD.is_match(&lower)
}

fn parent_chain(element: ElementRef) -> impl Iterator<Item = ElementRef> {
    std::iter::successors(Some(element), |e| e.parent().and_then(ElementRef::wrap))
}

fn element_text(element: ElementRef) -> String {
    element.text().collect::<Vec<_>>().join(" ").trim().to_string()
}

fn parse_snippet_links(document: &Html, limit: usize) -> Vec<Item> {
    let mut items = Vec::new();
    let mut seen_urls = std::collections::HashSet::new();

    for anchor in document.select(&SNIPPET_LINK) {
        let href = match anchor.value().attr("href") {
            Some(h) if !h.trim().is_empty() => h.trim(),
            _ => continue,
        };

        let title_node = anchor
            .select(&SNIPPET_TITLE)
            .next()
            .or_else(|| anchor.select(&ITEMPROP_NAME).next());
        let raw_title = title_node
            .and_then(|n| n.value().attr("title").map(str::to_string))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| title_node.map(element_text).unwrap_or_default());
        let title = clean_title(&raw_title);
        if title.is_empty() || looks_like_page_noise(&title) {
            continue;
        }

        let product_url = abs_url(BASE_URL, href);
        if product_url.is_empty() || !seen_urls.insert(product_url.clone()) {
            continue;
        }

        let container = parent_chain(anchor)
            .take(12)
            .find(|c| c.select(&PRICE_CURRENT).next().is_some() || c.select(&PRICE_PREFIX).next().is_some())
            .unwrap_or(anchor);

        let price_node = container
            .select(&PRICE_CURRENT)
            .next()
            .or_else(|| container.select(&PRICE_PREFIX).next());
        let price_text = price_node.map(element_text).unwrap_or_else(|| element_text(container));
        let price = normalize_price(first_price(&price_text));

        let img = container
            .select(&PICTURE_IMG)
            .next()
            .or_else(|| container.select(&IMG).next())
            .or_else(|| anchor.select(&PICTURE_IMG).next())
            .or_else(|| anchor.select(&IMG).next());
        let thumb = img
            .map(|i| {
                let v = i.value();
                img_url(
                    &[
                        v.attr("data-savepage-currentsrc"),
                        v.attr("data-savepage-src"),
                        v.attr("data-src"),
                        v.attr("data-lazy"),
                        v.attr("data-original"),
                        v.attr("src"),
                    ],
                    v.attr("srcset"),
                )
            })
            .unwrap_or_default();

        let pid = yandex_pid_from_url(&product_url);
        items.push(Item {
            id: format!("yandex-{}", pid),
            title,
            price,
            thumbnail_url: thumb,
            product_url,
            source: NAME.to_string(),
            merchant_name: NAME.to_string(),
            merchant_logo_url: String::new(),
        });
        if items.len() >= limit {
            break;
        }
    }
    items
}

fn parse_json_ld(document: &Html, limit: usize) -> Vec<Item> {
    let mut items = Vec::new();
    for script in document.select(&LD_JSON) {
        let raw = element_text(script);
        if raw.is_empty() {
            continue;
        }
        let data: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(_) => continue,
        };
        for obj in iter_json_ld_objects(&data) {
            let ty = obj
                .get("@type")
                .and_then(|t| if t.is_array() { t.get(0) } else { Some(t) })
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_lowercase();

            let mut candidates: Vec<&serde_json::Value> = Vec::new();
            if ty == "itemlist" {
                if let Some(elems) = obj.get("itemListElement").and_then(|v| v.as_array()) {
                    for el in elems {
                        if let Some(item) = el.get("item").filter(|v| v.is_object()) {
                            candidates.push(item);
                        }
                    }
                }
            } else if ty == "product" {
                candidates.push(obj);
            }

            for product in candidates {
                let name = product.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                if name.is_empty() {
                    continue;
                }
                let url_field = product.get("url").and_then(|v| v.as_str()).unwrap_or_default();
                let product_url = abs_url(BASE_URL, url_field);
                let path = url::Url::parse(&product_url).map(|u| u.path().to_string()).unwrap_or_default();
                if !(path.contains("/product--") || path.contains("/product/") || path.contains("/card/")) {
                    continue;
                }
                let title = clean_title(name);
                if title.is_empty() || looks_like_page_noise(&title) {
                    continue;
                }
                let offers = product.get("offers");
                let price_val = offers
                    .and_then(|o| o.get("price").or_else(|| o.get("lowPrice")).or_else(|| o.get("highPrice")))
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                let price = normalize_price(first_price(&price_val));
                if price == 0 {
                    continue;
                }

                let pid = format!("yandex-{}", yandex_pid_from_url(&product_url));
                items.push(Item {
                    id: pid,
                    title,
                    price,
                    thumbnail_url: String::new(),
                    product_url,
                    source: NAME.to_string(),
                    merchant_name: NAME.to_string(),
                    merchant_logo_url: String::new(),
                });
                if items.len() >= limit {
                    return items;
                }
            }
        }
    }
    items
}

fn iter_json_ld_objects(value: &serde_json::Value) -> Vec<&serde_json::Value> {
    match value {
        serde_json::Value::Array(arr) => arr.iter().flat_map(iter_json_ld_objects).collect(),
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::Array(graph)) = map.get("@graph") {
                graph.iter().filter(|v| v.is_object()).collect()
            } else {
                vec![value]
            }
        }
        _ => Vec::new(),
    }
}

fn parse_next_data(html: &str, limit: usize) -> Vec<Item> {
    let raw = match NEXT_DATA_SCRIPT.captures(html) {
        Some(caps) => caps[1].trim().to_string(),
        None => return Vec::new(),
    };
    let data: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let mut items = Vec::new();
    let mut seen = std::collections::HashSet::new();
    walk_next_data(&data, limit, &mut items, &mut seen);
    items
}

fn walk_next_data(
    value: &serde_json::Value,
    limit: usize,
    items: &mut Vec<Item>,
    seen: &mut std::collections::HashSet<String>,
) {
    if items.len() >= limit {
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            let url_field = ["url", "href", "link", "offerUrl", "productUrl", "canonicalUrl"]
                .iter()
                .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
                .unwrap_or_default();
            if url_field.contains("/product--") || url_field.contains("/product/") || url_field.contains("/card/") {
                let product_url = abs_url(BASE_URL, url_field);
                if !product_url.is_empty() && seen.insert(product_url.clone()) {
                    let raw_title = ["title", "name", "offerName", "shortTitle", "displayName"]
                        .iter()
                        .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
                        .unwrap_or_default();
                    let title = clean_title(raw_title);
                    if !title.is_empty() && !looks_like_page_noise(&title) {
                        let price = normalize_price(extract_first_int(
                            value,
                            &["price", "priceValue", "currentPrice", "finalPrice", "minPrice", "lowPrice"],
                        ));
                        if price != 0 {
                            let pid = yandex_pid_from_url(&product_url);
                            if !pid.is_empty() {
                                items.push(Item {
                                    id: format!("yandex-{}", pid),
                                    title,
                                    price,
                                    thumbnail_url: String::new(),
                                    product_url,
                                    source: NAME.to_string(),
                                    merchant_name: NAME.to_string(),
                                    merchant_logo_url: String::new(),
                                });
                            }
                        }
                    }
                }
            }
            for v in map.values() {
                walk_next_data(v, limit, items, seen);
            }
        }
        serde_json::Value::Array(arr) => {
            for v in arr {
                walk_next_data(v, limit, items, seen);
            }
        }
        _ => {}
    }
}

fn extract_first_int(obj: &serde_json::Value, keys_hint: &[&str]) -> i64 {
    match obj {
        serde_json::Value::Object(map) => {
            for key in keys_hint {
                if let Some(v) = map.get(*key) {
                    if let Some(n) = v.as_i64() {
                        return n;
                    }
                    if let Some(s) = v.as_str() {
                        let p = first_price(s);
                        if p != 0 {
                            return p;
                        }
                    }
                }
            }
            for v in map.values() {
                let got = extract_first_int(v, keys_hint);
                if got != 0 {
                    return got;
                }
            }
            0
        }
        serde_json::Value::Array(arr) => {
            for v in arr {
                let got = extract_first_int(v, keys_hint);
                if got != 0 {
                    return got;
                }
            }
            0
        }
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0),
        serde_json::Value::String(s) => first_price(s),
        _ => 0,
    }
}

fn parse_generic_anchors(document: &Html, limit: usize) -> Vec<Item> {
    let mut items = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for anchor in document.select(&PRODUCT_ANCHOR) {
        let href = anchor.value().attr("href").unwrap_or_default();
        let product_url = abs_url(BASE_URL, href);
        if product_url.is_empty() || !seen.insert(product_url.clone()) {
            continue;
        }

        let raw_title = anchor
            .value()
            .attr("aria-label")
            .or_else(|| anchor.value().attr("title"))
            .map(str::to_string)
            .unwrap_or_else(|| element_text(anchor));
        let title = clean_title(&raw_title);
        if title.is_empty() || looks_like_page_noise(&title) {
            continue;
        }

        let container = parent_chain(anchor)
            .take(10)
            .find(|c| first_price(&element_text(*c)) > 0)
            .unwrap_or(anchor);
        let price = normalize_price(first_price(&element_text(container)));

        let img = container.select(&IMG).next().or_else(|| anchor.select(&IMG).next());
        let thumb = img
            .map(|i| first_http_url(&[i.value().attr("src").unwrap_or_default()]))
            .unwrap_or_default();

        let pid = yandex_pid_from_url(&product_url);
        items.push(Item {
            id: format!("yandex-{}", pid),
            title,
            price,
            thumbnail_url: thumb,
            product_url,
            source: NAME.to_string(),
            merchant_name: NAME.to_string(),
            merchant_logo_url: String::new(),
        });
        if items.len() >= limit {
            break;
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_url_includes_page_and_rs() {
        let url = YandexAdapter::search_url("iphone 15", 2, "abc123");
        assert!(url.contains("page=2"));
        assert!(url.contains("rs=abc123"));
        assert!(url.contains("how=aprice"));
    }

    #[test]
    fn pid_from_card_path() {
        let pid = yandex_pid_from_url("https://market.yandex.ru/card/apple-iphone-15/123456");
        assert_eq!(pid, "123456");
    }

    #[test]
    fn pid_falls_back_to_stable_hash() {
        let pid = yandex_pid_from_url("https://market.yandex.ru/some/unrelated/path");
        assert_eq!(pid.len(), 12);
    }

    #[test]
    fn parses_snippet_link_markup() {
        let html = r#"
            <div class="card">
                <a data-auto="snippet-link" href="/card/apple-iphone-15/100500">
                    <span data-auto="snippet-title" title="Apple iPhone 15 128GB"></span>
                    <span data-auto="snippet-price-current">79 990 ₽</span>
                </a>
            </div>
        "#;
        let fetch = Arc::new(FetchClientPool::new(crate::config::EngineConfig::default()));
        let cooldowns = Arc::new(CooldownRegistry::new());
        let adapter = YandexAdapter::new(fetch, cooldowns);
        let items = adapter.parse_html(html, 10);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].price, 79_990);
        assert_eq!(items[0].id, "yandex-100500");
    }
}
