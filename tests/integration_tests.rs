use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use federated_search_engine::adapters::{AdapterRegistry, SourceAdapter};
use federated_search_engine::model::Item;
use federated_search_engine::orchestrator::{Engine, SearchRequest};
use federated_search_engine::EngineConfig;

struct FakeAdapter {
    name: String,
    items: Vec<Item>,
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl SourceAdapter for FakeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, _query: &str, limit: usize) -> anyhow::Result<Vec<Item>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.items.iter().take(limit).cloned().collect())
    }
}

fn item(source: &str, id: &str, price: i64, title: &str) -> Item {
    Item {
        id: id.to_string(),
        title: title.to_string(),
        price,
        thumbnail_url: String::new(),
        product_url: format!("https://{}/item/{}", source, id),
        source: source.to_string(),
        merchant_name: String::new(),
        merchant_logo_url: String::new(),
    }
}

fn engine_with(adapters: Vec<Arc<dyn SourceAdapter>>) -> Engine {
    let mut registry = AdapterRegistry::new();
    for a in adapters {
        registry.register(a);
    }
    Engine::with_adapters(EngineConfig::default(), registry)
}

#[tokio::test]
async fn merges_and_sorts_multiple_sources_by_price() -> Result<()> {
    let engine = engine_with(vec![
        Arc::new(FakeAdapter {
            name: "mvideo.ru".to_string(),
            items: vec![item("mvideo.ru", "1", 90_000, "iPhone 15 256GB")],
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }),
        Arc::new(FakeAdapter {
            name: "citilink.ru".to_string(),
            items: vec![item("citilink.ru", "1", 75_000, "iPhone 15 256GB")],
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }),
    ]);

    let resp = engine
        .search_products(SearchRequest {
            query: "iphone 15".to_string(),
            offset: 0,
            limit: 10,
            sources: Some(vec!["mvideo.ru".to_string(), "citilink.ru".to_string()]),
            per_source: false,
            partial: false,
        })
        .await?;

    assert_eq!(resp.items.len(), 2);
    assert_eq!(resp.items[0].source, "citilink.ru");
    assert_eq!(resp.items[1].source, "mvideo.ru");
    assert_eq!(resp.total_sources, 2);
    Ok(())
}

#[tokio::test]
async fn dedups_items_sharing_source_and_id() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(vec![Arc::new(FakeAdapter {
        name: "avito.ru".to_string(),
        items: vec![
            item("avito.ru", "dup", 1_000, "iPhone 15 case"),
            item("avito.ru", "dup", 1_000, "iPhone 15 case"),
        ],
        calls,
        delay: Duration::ZERO,
    })]);

    let resp = engine
        .search_products(SearchRequest {
            query: "iphone 15".to_string(),
            offset: 0,
            limit: 10,
            sources: Some(vec!["avito.ru".to_string()]),
            per_source: false,
            partial: false,
        })
        .await?;

    assert_eq!(resp.items.len(), 1);
    Ok(())
}

#[tokio::test]
async fn offset_past_the_end_yields_an_empty_page_without_has_more() -> Result<()> {
    let engine = engine_with(vec![Arc::new(FakeAdapter {
        name: "avito.ru".to_string(),
        items: vec![item("avito.ru", "1", 1_000, "iPhone 15 case")],
        calls: Arc::new(AtomicUsize::new(0)),
        delay: Duration::ZERO,
    })]);

    let resp = engine
        .search_products(SearchRequest {
            query: "iphone 15".to_string(),
            offset: 50,
            limit: 10,
            sources: Some(vec!["avito.ru".to_string()]),
            per_source: false,
            partial: false,
        })
        .await?;

    assert!(resp.items.is_empty());
    assert!(!resp.has_more);
    assert!(resp.next_offset.is_none());
    Ok(())
}

#[tokio::test]
async fn per_source_pagination_returns_a_slice_from_each_source() -> Result<()> {
    let engine = engine_with(vec![
        Arc::new(FakeAdapter {
            name: "mvideo.ru".to_string(),
            items: vec![
                item("mvideo.ru", "1", 10_000, "iPhone 15 case"),
                item("mvideo.ru", "2", 20_000, "iPhone 15 case"),
            ],
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }),
        Arc::new(FakeAdapter {
            name: "citilink.ru".to_string(),
            items: vec![item("citilink.ru", "1", 15_000, "iPhone 15 case")],
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }),
    ]);

    let resp = engine
        .search_products(SearchRequest {
            query: "iphone 15".to_string(),
            offset: 0,
            limit: 1,
            sources: Some(vec!["mvideo.ru".to_string(), "citilink.ru".to_string()]),
            per_source: true,
            partial: false,
        })
        .await?;

    assert_eq!(resp.items.len(), 2);
    let sources: Vec<&str> = resp.items.iter().map(|i| i.source.as_str()).collect();
    assert!(sources.contains(&"mvideo.ru"));
    assert!(sources.contains(&"citilink.ru"));
    Ok(())
}

#[tokio::test]
async fn repeated_identical_calls_are_served_from_cache() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(vec![Arc::new(FakeAdapter {
        name: "avito.ru".to_string(),
        items: vec![item("avito.ru", "1", 1_000, "iPhone 15 case")],
        calls: calls.clone(),
        delay: Duration::ZERO,
    })]);

    for _ in 0..3 {
        engine
            .search_products(SearchRequest {
                query: "iphone 15".to_string(),
                offset: 0,
                limit: 10,
                sources: Some(vec!["avito.ru".to_string()]),
                per_source: false,
                partial: false,
            })
            .await?;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn query_outside_length_bounds_is_rejected() {
    let engine = engine_with(vec![]);
    assert!(engine
        .search_products(SearchRequest {
            query: "a".to_string(),
            offset: 0,
            limit: 10,
            sources: Some(vec!["avito.ru".to_string()]),
            per_source: false,
            partial: false,
        })
        .await
        .is_err());

    let too_long = "a".repeat(121);
    assert!(engine
        .search_products(SearchRequest {
            query: too_long,
            offset: 0,
            limit: 10,
            sources: Some(vec!["avito.ru".to_string()]),
            per_source: false,
            partial: false,
        })
        .await
        .is_err());
}

#[tokio::test]
async fn limit_outside_bounds_is_rejected() {
    let engine = engine_with(vec![]);
    assert!(engine
        .search_products(SearchRequest {
            query: "iphone 15".to_string(),
            offset: 0,
            limit: 101,
            sources: Some(vec!["avito.ru".to_string()]),
            per_source: false,
            partial: false,
        })
        .await
        .is_err());
}

#[tokio::test]
async fn non_matching_items_are_filtered_out_by_query_tokens() -> Result<()> {
    let engine = engine_with(vec![Arc::new(FakeAdapter {
        name: "avito.ru".to_string(),
        items: vec![item("avito.ru", "1", 1_000, "Samsung Galaxy S24 Ultra")],
        calls: Arc::new(AtomicUsize::new(0)),
        delay: Duration::ZERO,
    })]);

    let resp = engine
        .search_products(SearchRequest {
            query: "iphone 15".to_string(),
            offset: 0,
            limit: 10,
            sources: Some(vec!["avito.ru".to_string()]),
            per_source: false,
            partial: false,
        })
        .await?;

    assert!(resp.items.is_empty());
    Ok(())
}
