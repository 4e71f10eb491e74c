mod generic;
mod yandex;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cooldown::CooldownRegistry;
use crate::http_client::FetchClientPool;
use crate::model::Item;

pub use generic::GenericHttpAdapter;
pub use yandex::{YandexAdapter, MAX_PAGES as YANDEX_MAX_PAGES, NAME as YANDEX_NAME};

/// Contract every e-commerce source integration implements. Adapters are
/// stateless between calls — any state they need across calls lives in the
/// shared `CooldownRegistry` passed in at construction.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Returns up to `limit` items matching `query`. Never returns an `Err`
    /// for ordinary fetch/parse failures — those are logged and folded into
    /// an empty result, per the engine's failure semantics; adapters should
    /// only propagate truly unexpected errors (e.g. a programming bug).
    async fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<Item>>;
}

/// Named collection of adapters the orchestrator fans out across. Unknown
/// source names in a request are looked up here and silently skipped if
/// absent.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Builds the registry's default illustrative set: the Yandex fast
    /// source plus a generic HTTP/JSON adapter standing in for the rest of
    /// the default source list.
    pub fn with_demo_adapters(fetch: Arc<FetchClientPool>, cooldowns: Arc<CooldownRegistry>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(YandexAdapter::new(fetch.clone(), cooldowns.clone())));
        for source in crate::normalize::DEFAULT_SOURCES
            .iter()
            .filter(|s| **s != "market.yandex.ru")
        {
            registry.register(Arc::new(GenericHttpAdapter::new(
                source.to_string(),
                fetch.clone(),
                cooldowns.clone(),
            )));
        }
        registry
    }
}
