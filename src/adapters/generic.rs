use std::sync::Arc;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{error, info};

use crate::cooldown::CooldownRegistry;
use crate::http_client::{looks_like_block_page, FetchClientPool};
use crate::model::Item;
use crate::normalize::{
    abs_url, clean_title, display_merchant_name, first_http_url, matches_query, normalize_price,
    prices_from_text, query_tokens, stable_item_id,
};

use super::SourceAdapter;

/// Illustrative adapter shared by the non-Yandex default sources: fetches a
/// plain search-results page and lifts product tiles out of generic anchor
/// markup. Real per-site scraping rules belong one adapter per source; this
/// stands in for that long tail.
pub struct GenericHttpAdapter {
    source: String,
    fetch: Arc<FetchClientPool>,
    cooldowns: Arc<CooldownRegistry>,
}

impl GenericHttpAdapter {
    pub fn new(source: String, fetch: Arc<FetchClientPool>, cooldowns: Arc<CooldownRegistry>) -> Self {
        Self {
            source,
            fetch,
            cooldowns,
        }
    }

    fn search_url(&self, query: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        format!("https://{}/search?text={}", self.source, encoded)
    }

    fn parse(&self, base: &str, html: &str, tokens: &crate::model::QueryTokens, limit: usize) -> Vec<Item> {
        let document = Html::parse_document(html);
        let anchor_sel = Selector::parse("a[href]").unwrap();
        let img_sel = Selector::parse("img").unwrap();

        let mut items = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for anchor in document.select(&anchor_sel) {
            let href = anchor.value().attr("href").unwrap_or_default();
            if href.is_empty() {
                continue;
            }
            let text = anchor.text().collect::<Vec<_>>().join(" ");
            let title = clean_title(&text);
            if title.is_empty() || !matches_query(&title, tokens) {
                continue;
            }
            let product_url = abs_url(base, href);
            if product_url.is_empty() || !seen.insert(product_url.clone()) {
                continue;
            }

            let prices = prices_from_text(&text);
            let price = normalize_price(prices.into_iter().max().unwrap_or(0));

            let thumb = anchor
                .select(&img_sel)
                .next()
                .map(|img| first_http_url(&[img.value().attr("src").unwrap_or_default()]))
                .unwrap_or_default();

            let id = stable_item_id(&product_url);
            items.push(Item {
                id: format!("{}-{}", self.source, id),
                title,
                price,
                thumbnail_url: thumb,
                product_url,
                source: self.source.clone(),
                merchant_name: display_merchant_name(&self.source),
                merchant_logo_url: String::new(),
            });
            if items.len() >= limit {
                break;
            }
        }
        items
    }
}

#[async_trait]
impl SourceAdapter for GenericHttpAdapter {
    fn name(&self) -> &str {
        &self.source
    }

    async fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<Item>> {
        if self.cooldowns.active(&self.source) {
            return Ok(Vec::new());
        }
        let url = self.search_url(query);
        let result = self.fetch.get(&self.source, &url).await;
        if result.html.is_empty() {
            error!(
                "{}: fetch failed: {}",
                self.source,
                result.error.as_deref().unwrap_or("unknown")
            );
            return Ok(Vec::new());
        }
        if looks_like_block_page(&result.title, &result.html) {
            self.cooldowns.set(&self.source, 15.0 * 60.0, "block-page");
            return Ok(Vec::new());
        }

        let base = format!("https://{}", self.source);
        let tokens = query_tokens(query);
        let items = self.parse(&base, &result.html, &tokens, limit);
        info!("{}: parsed {} items", self.source, items.len());
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn parses_matching_anchor_tiles() {
        let fetch = Arc::new(FetchClientPool::new(EngineConfig::default()));
        let cooldowns = Arc::new(CooldownRegistry::new());
        let adapter = GenericHttpAdapter::new("example.ru".to_string(), fetch, cooldowns);
        let html = r#"
            <a href="/item/1">iPhone 15 128GB — 79990 руб</a>
            <a href="/item/2">Совершенно другой товар — 500 руб</a>
        "#;
        let tokens = query_tokens("iphone 15");
        let items = adapter.parse("https://example.ru", html, &tokens, 10);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].price, 79_990);
        assert_eq!(items[0].source, "example.ru");
    }
}
