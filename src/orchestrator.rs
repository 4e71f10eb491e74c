use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::adapters::{AdapterRegistry, YandexAdapter, YANDEX_MAX_PAGES, YANDEX_NAME};
use crate::cache::{QueryCache, CACHE_TTL, MAX_CACHE_ITEMS};
use crate::config::EngineConfig;
use crate::cooldown::CooldownRegistry;
use crate::error::{EngineError, Result};
use crate::http_client::FetchClientPool;
use crate::model::{CacheEntry, CacheEntryState, Item, ProviderOutcome, ProviderResult, QueryTokens, SearchResponse};
use crate::normalize::{
    cache_key, clean_ali_title, clean_title, display_merchant_name, matches_query, normalize_price,
    normalize_sources, query_tokens,
};
use crate::ranking;

const PER_SOURCE_LIMIT: usize = 20;
const SLOW_SOURCES_TIMEOUT_SECONDS: f64 = 8.0;
const SLOW_SOURCES_TIMEOUT_SECONDS_PER_SOURCE: f64 = 60.0;

/// Caller-supplied search parameters, validated at the orchestrator boundary.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub offset: usize,
    pub limit: usize,
    pub sources: Option<Vec<String>>,
    pub per_source: bool,
    pub partial: bool,
}

impl SearchRequest {
    fn validate(&self) -> Result<()> {
        let len = self.query.trim().chars().count();
        if !(2..=120).contains(&len) {
            return Err(EngineError::InvalidQuery);
        }
        if !(1..=100).contains(&self.limit) {
            return Err(EngineError::InvalidLimit);
        }
        Ok(())
    }
}

/// The heart of the crate: owns the query cache, the cooldown registry, the
/// fetch client pool, and the adapter registry, and drives a single search
/// end to end — Yandex incremental fill, fan-out with a deadline, background
/// straggler completion, and the final ranked/paginated view.
pub struct Engine {
    cache: QueryCache,
    #[allow(dead_code)]
    cooldowns: Arc<CooldownRegistry>,
    fetch: Arc<FetchClientPool>,
    adapters: AdapterRegistry,
    yandex: Arc<YandexAdapter>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let cooldowns = Arc::new(CooldownRegistry::new());
        let fetch = Arc::new(FetchClientPool::new(config.clone()));
        let yandex = Arc::new(YandexAdapter::new(fetch.clone(), cooldowns.clone()));
        let adapters = AdapterRegistry::with_demo_adapters(fetch.clone(), cooldowns.clone());
        Self {
            cache: QueryCache::new(),
            cooldowns,
            fetch,
            adapters,
            yandex,
            config,
        }
    }

    /// Builds an engine with a caller-supplied adapter registry, used by
    /// tests to substitute deterministic fakes for live-network adapters.
    pub fn with_adapters(config: EngineConfig, adapters: AdapterRegistry) -> Self {
        let cooldowns = Arc::new(CooldownRegistry::new());
        let fetch = Arc::new(FetchClientPool::new(config.clone()));
        let yandex = Arc::new(YandexAdapter::new(fetch.clone(), cooldowns.clone()));
        Self {
            cache: QueryCache::new(),
            cooldowns,
            fetch,
            adapters,
            yandex,
            config,
        }
    }

    pub async fn search_products(&self, req: SearchRequest) -> Result<SearchResponse> {
        req.validate()?;

        let mut explicit_sources = req.sources.is_some();
        let sources_n = normalize_sources(req.sources.as_deref());
        if !explicit_sources && sources_n.len() > 1 {
            explicit_sources = true;
        }

        let key = cache_key(&req.query, &sources_n);
        let entry = self.cache.get_or_create(&key).await;

        let mut state = entry.lock.lock().await;
        let now = std::time::Instant::now();
        if state.expires_at <= now {
            state.reset(now, CACHE_TTL);
        }

        let per_source_target = if req.per_source {
            Some(req.offset + req.limit)
        } else {
            None
        };
        let target = match per_source_target {
            Some(t) => t.saturating_mul(sources_n.len()).min(MAX_CACHE_ITEMS),
            None => (req.offset + req.limit).min(MAX_CACHE_ITEMS),
        };

        let mut slow_timeout = if req.partial {
            SLOW_SOURCES_TIMEOUT_SECONDS
        } else if req.per_source {
            SLOW_SOURCES_TIMEOUT_SECONDS_PER_SOURCE
        } else {
            SLOW_SOURCES_TIMEOUT_SECONDS
        };
        if sources_n.len() == 1 {
            slow_timeout = slow_timeout.max(self.config.search_timeout_seconds as f64);
        }
        let wait_for_all = req.per_source && !req.partial;

        self.ensure_cached(
            &entry,
            &mut state,
            &req.query,
            target,
            &sources_n,
            explicit_sources,
            per_source_target,
            Duration::from_secs_f64(slow_timeout),
            wait_for_all,
        )
        .await;

        state.items.sort_by(ranking::sort_key);

        let mut pending_sources: Vec<String> = state.pending_sources.iter().cloned().collect();
        pending_sources.sort();
        let total_sources = sources_n.len();
        let checked_sources = total_sources.saturating_sub(pending_sources.len());

        let view = ranking::paginate(&state, &sources_n, req.offset, req.limit, req.per_source, req.partial);
        drop(state);

        let next_offset = if view.has_more && !view.items.is_empty() {
            Some(req.offset + if req.per_source { req.limit } else { view.items.len() })
        } else {
            None
        };

        Ok(SearchResponse {
            items: view.items,
            offset: req.offset,
            limit: req.limit,
            next_offset,
            has_more: view.has_more,
            checked_sources,
            total_sources,
            pending_sources,
        })
    }

    /// Drives the fast source incrementally, then fans out the remaining
    /// sources with a deadline. Mirrors `_ensure_cached` in the system this
    /// crate's orchestration is modeled on, one step at a time.
    #[allow(clippy::too_many_arguments)]
    async fn ensure_cached(
        &self,
        entry: &Arc<CacheEntry>,
        state: &mut CacheEntryState,
        query: &str,
        target: usize,
        sources: &[String],
        explicit_sources: bool,
        per_source_target: Option<usize>,
        slow_timeout: Duration,
        wait_for_all: bool,
    ) {
        if state.items.len() >= target && !explicit_sources {
            return;
        }

        if sources.iter().any(|s| s == YANDEX_NAME) && !state.yandex_exhausted {
            let yandex_target = per_source_target.unwrap_or(target);
            self.fill_yandex(state, query, yandex_target).await;
        }

        if state.items.len() >= target && !explicit_sources {
            return;
        }

        let remaining = target.saturating_sub(state.items.len());
        if !explicit_sources && remaining == 0 {
            return;
        }

        let non_yandex: Vec<String> = sources.iter().filter(|s| s.as_str() != YANDEX_NAME).cloned().collect();

        let per_source_limit = if explicit_sources {
            if non_yandex.is_empty() {
                return;
            }
            match per_source_target {
                Some(t) => t,
                None => {
                    let uniform_budget = PER_SOURCE_LIMIT * non_yandex.len();
                    if target > uniform_budget {
                        (target + non_yandex.len() - 1) / non_yandex.len()
                    } else {
                        PER_SOURCE_LIMIT
                    }
                }
            }
        } else {
            remaining
        };
        if per_source_limit == 0 {
            return;
        }

        let track_limits = !explicit_sources || per_source_target.is_some();

        // (source, requested_limit, prev_limit)
        let mut scheduled: Vec<(String, usize, usize)> = Vec::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProviderResult>();

        for source in &non_yandex {
            if state.pending_sources.contains(source) {
                continue;
            }
            let prev_limit = if track_limits {
                *state.source_limits.get(source).unwrap_or(&0)
            } else {
                0
            };
            if track_limits && prev_limit >= per_source_limit {
                continue;
            }
            let adapter = match self.adapters.get(source) {
                Some(a) => a,
                None => {
                    warn!("search: unknown source {:?}, skipping", source);
                    continue;
                }
            };
            scheduled.push((source.clone(), per_source_limit, prev_limit));

            let tx = tx.clone();
            let query_owned = query.to_string();
            let source_owned = source.clone();
            tokio::spawn(async move {
                let outcome = match adapter.search(&query_owned, per_source_limit).await {
                    Ok(items) => ProviderOutcome::Items(items),
                    Err(e) => ProviderOutcome::Error(e.to_string()),
                };
                let _ = tx.send(ProviderResult {
                    source: source_owned,
                    requested_limit: per_source_limit,
                    prev_limit,
                    outcome,
                });
            });
        }
        drop(tx);

        if scheduled.is_empty() {
            return;
        }

        let tokens = query_tokens(query);
        let mut applied: HashSet<String> = HashSet::new();

        if wait_for_all {
            while applied.len() < scheduled.len() {
                match rx.recv().await {
                    Some(result) => {
                        let source = result.source.clone();
                        apply_provider_result(state, &tokens, explicit_sources, track_limits, result);
                        applied.insert(source);
                    }
                    None => break,
                }
            }
            state.pending_sources.clear();
            return;
        }

        let sleep = tokio::time::sleep(slow_timeout);
        tokio::pin!(sleep);
        loop {
            if applied.len() >= scheduled.len() {
                break;
            }
            tokio::select! {
                biased;
                msg = rx.recv() => {
                    match msg {
                        Some(result) => {
                            let source = result.source.clone();
                            apply_provider_result(state, &tokens, explicit_sources, track_limits, result);
                            applied.insert(source);
                        }
                        None => break,
                    }
                }
                _ = &mut sleep => {
                    break;
                }
            }
        }

        let still_pending: Vec<String> = scheduled
            .iter()
            .filter(|(source, _, _)| !applied.contains(source))
            .map(|(source, _, _)| source.clone())
            .collect();

        if still_pending.is_empty() {
            return;
        }

        warn!(
            "search: {} source(s) timed out after {:?} (partial results)",
            still_pending.join(","),
            slow_timeout
        );
        state.pending_sources.extend(still_pending.iter().cloned());

        let entry = entry.clone();
        let explicit_sources_bg = explicit_sources;
        let track_limits_bg = track_limits;
        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                let source = result.source.clone();
                let mut state = entry.lock.lock().await;
                apply_provider_result(&mut state, &tokens, explicit_sources_bg, track_limits_bg, result);
                state.pending_sources.remove(&source);
            }
        });
    }

    /// Pulls Yandex search-result pages one at a time under a page cursor
    /// until `yandex_target` items have been collected, the global item cap
    /// is hit, or the source is exhausted.
    async fn fill_yandex(&self, state: &mut CacheEntryState, query: &str, yandex_target: usize) {
        let tokens = query_tokens(query);

        loop {
            if state.yandex_count() >= yandex_target || state.items.len() >= MAX_CACHE_ITEMS {
                break;
            }
            if state.yandex_next_page > YANDEX_MAX_PAGES {
                state.yandex_exhausted = true;
                break;
            }

            let page = state.yandex_next_page;
            let url = YandexAdapter::search_url(query, page, &state.yandex_rs);
            let result = self.fetch.get(YANDEX_NAME, &url).await;
            if result.html.is_empty() {
                error!(
                    "{}: fetch failed (page={}): {}",
                    YANDEX_NAME,
                    page,
                    result.error.as_deref().unwrap_or("unknown")
                );
                // A transient network error must not poison the cache for the
                // full TTL — leave `yandex_exhausted` false so the next call
                // can retry this page.
                break;
            }

            if let Some(rs) = YandexAdapter::extract_rs(&result.final_url) {
                state.yandex_rs = rs;
            }

            let parsed_items = self.yandex.parse_html(&result.html, 100);
            state.yandex_next_page += 1;

            let page_items: Vec<Item> = if !tokens.is_empty() && !parsed_items.is_empty() {
                if tokens.len() == 2 {
                    let first = QueryTokens { tokens: vec![tokens.tokens[0].clone()] };
                    let second = QueryTokens { tokens: vec![tokens.tokens[1].clone()] };
                    parsed_items
                        .into_iter()
                        .filter(|item| matches_query(&item.title, &first) || matches_query(&item.title, &second))
                        .collect()
                } else {
                    parsed_items.into_iter().filter(|item| matches_query(&item.title, &tokens)).collect()
                }
            } else {
                parsed_items
            };

            if page_items.is_empty() {
                error!("{}: parsed 0 items (page={}, title={:?})", YANDEX_NAME, page, result.title);
                state.yandex_exhausted = true;
                break;
            }

            let mut added = 0;
            for mut item in page_items {
                item.title = clean_title(&item.title);
                item.price = normalize_price(item.price);
                if item.merchant_name.is_empty() || item.merchant_name == item.source {
                    item.merchant_name = display_merchant_name(&item.source);
                }
                let dedup_key = item.dedup_key();
                if state.seen.contains(&dedup_key) {
                    continue;
                }
                state.seen.insert(dedup_key);
                state.items.push(item);
                added += 1;
                if state.yandex_count() >= yandex_target || state.items.len() >= MAX_CACHE_ITEMS {
                    break;
                }
            }

            if added == 0 {
                state.yandex_exhausted = true;
                break;
            }
        }
    }
}

/// Applies one adapter's outcome to the entry: re-cleans the title,
/// re-normalizes the price, fills in a display merchant name, drops items
/// that don't match the query tokens, dedupes, and appends. Also updates
/// the source's fetch watermark so the next call doesn't redundantly
/// re-schedule it at the same or a lower limit.
fn apply_provider_result(
    state: &mut CacheEntryState,
    tokens: &QueryTokens,
    explicit_sources: bool,
    track_limits: bool,
    result: ProviderResult,
) {
    let ProviderResult {
        source,
        requested_limit,
        prev_limit,
        outcome,
    } = result;

    match outcome {
        ProviderOutcome::Error(cause) => {
            error!("{}: failed: {}", source, cause);
            if track_limits {
                state.source_limits.insert(source, requested_limit);
            }
        }
        ProviderOutcome::Items(items) => {
            if !items.is_empty() || !explicit_sources {
                state
                    .source_limits
                    .insert(source.clone(), prev_limit.max(requested_limit));
            }
            for mut item in items {
                item.title = if item.source == "aliexpress.ru" {
                    clean_ali_title(&item.title)
                } else {
                    clean_title(&item.title)
                };
                item.price = normalize_price(item.price);
                if item.merchant_name.is_empty() || item.merchant_name == item.source {
                    item.merchant_name = display_merchant_name(&item.source);
                }

                if !tokens.is_empty() && !matches_query(&item.title, tokens) {
                    continue;
                }

                let dedup_key = item.dedup_key();
                if state.seen.contains(&dedup_key) {
                    continue;
                }
                state.seen.insert(dedup_key);
                state.items.push(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SourceAdapter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

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
    async fn single_source_request_rejects_unknown_and_returns_matching_items() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine_with(vec![Arc::new(FakeAdapter {
            name: "avito.ru".to_string(),
            items: vec![item("avito.ru", "a1", 50_000, "iPhone 15 128GB")],
            calls: calls.clone(),
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
            .await
            .unwrap();

        assert_eq!(resp.items.len(), 1);
        assert_eq!(resp.items[0].source, "avito.ru");
        assert_eq!(resp.total_sources, 1);
        assert!(resp.pending_sources.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_query_length_is_rejected() {
        let engine = engine_with(vec![]);
        let err = engine
            .search_products(SearchRequest {
                query: "a".to_string(),
                offset: 0,
                limit: 10,
                sources: Some(vec!["avito.ru".to_string()]),
                per_source: false,
                partial: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidQuery));
    }

    #[tokio::test]
    async fn invalid_limit_is_rejected() {
        let engine = engine_with(vec![]);
        let err = engine
            .search_products(SearchRequest {
                query: "iphone 15".to_string(),
                offset: 0,
                limit: 0,
                sources: Some(vec!["avito.ru".to_string()]),
                per_source: false,
                partial: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidLimit));
    }

    #[tokio::test]
    async fn slow_source_becomes_pending_under_partial_mode() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine_with(vec![Arc::new(FakeAdapter {
            name: "avito.ru".to_string(),
            items: vec![item("avito.ru", "a1", 50_000, "iPhone 15 128GB")],
            calls,
            delay: Duration::from_millis(200),
        })]);

        let resp = engine
            .search_products(SearchRequest {
                query: "iphone 15".to_string(),
                offset: 0,
                limit: 10,
                sources: Some(vec!["avito.ru".to_string()]),
                per_source: false,
                partial: true,
            })
            .await
            .unwrap();

        // The single-source rule bumps slow_timeout to search_timeout_seconds (35s
        // by default), well above the adapter's 200ms delay, so this still completes.
        assert_eq!(resp.items.len(), 1);
        assert!(resp.pending_sources.is_empty());
    }

    #[tokio::test]
    async fn unmatched_tokens_drop_the_item() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine_with(vec![Arc::new(FakeAdapter {
            name: "avito.ru".to_string(),
            items: vec![item("avito.ru", "a1", 10_000, "Samsung Galaxy S24")],
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
            .await
            .unwrap();

        assert!(resp.items.is_empty());
    }

    #[tokio::test]
    async fn repeated_calls_do_not_refetch_at_the_same_limit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine_with(vec![Arc::new(FakeAdapter {
            name: "avito.ru".to_string(),
            items: vec![item("avito.ru", "a1", 10_000, "iPhone 15 128GB")],
            calls: calls.clone(),
            delay: Duration::ZERO,
        })]);

        for _ in 0..2 {
            engine
                .search_products(SearchRequest {
                    query: "iphone 15".to_string(),
                    offset: 0,
                    limit: 5,
                    sources: Some(vec!["avito.ru".to_string()]),
                    per_source: false,
                    partial: false,
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
