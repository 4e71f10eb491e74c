use std::collections::HashSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// A single normalized product tile, as returned by a source adapter and
/// after re-normalization by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    pub title: String,
    /// Minor currency units; 0 means "unknown".
    pub price: i64,
    pub thumbnail_url: String,
    pub product_url: String,
    pub source: String,
    pub merchant_name: String,
    pub merchant_logo_url: String,
}

impl Item {
    pub fn dedup_key(&self) -> String {
        format!("{}|{}", self.source, self.id)
    }
}

/// Transient outcome of a single adapter call, used by `ensure_cached` to
/// decide whether to bump a source's watermark.
#[derive(Debug)]
pub struct ProviderResult {
    pub source: String,
    pub requested_limit: usize,
    pub prev_limit: usize,
    pub outcome: ProviderOutcome,
}

#[derive(Debug)]
pub enum ProviderOutcome {
    Items(Vec<Item>),
    Error(String),
}

/// Tokenized query: lowercase, `ё`→`е`, stopwords removed, deduped, capped at
/// 10 entries. Each token additionally carries its synonym set for matching.
#[derive(Debug, Clone, Default)]
pub struct QueryTokens {
    pub tokens: Vec<String>,
}

impl QueryTokens {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }
}

/// Per-`(query, sources)` cache state. Entry identity is preserved across
/// `reset` so stragglers that already hold a reference keep writing into the
/// same object after expiry.
pub struct CacheEntry {
    pub key: String,
    pub lock: Mutex<CacheEntryState>,
}

pub struct CacheEntryState {
    pub expires_at: Instant,
    pub items: Vec<Item>,
    pub seen: HashSet<String>,
    /// Highest `limit` already requested per source; avoids redundant refetch.
    pub source_limits: std::collections::HashMap<String, usize>,
    /// Sources whose current fetch is still in flight.
    pub pending_sources: HashSet<String>,
    pub yandex_next_page: u32,
    pub yandex_rs: String,
    pub yandex_exhausted: bool,
}

impl CacheEntryState {
    pub fn fresh(now: Instant, ttl: std::time::Duration) -> Self {
        Self {
            expires_at: now + ttl,
            items: Vec::new(),
            seen: HashSet::new(),
            source_limits: std::collections::HashMap::new(),
            pending_sources: HashSet::new(),
            yandex_next_page: 1,
            yandex_rs: String::new(),
            yandex_exhausted: false,
        }
    }

    /// Resets the entry in place, preserving object identity.
    pub fn reset(&mut self, now: Instant, ttl: std::time::Duration) {
        self.expires_at = now + ttl;
        self.items.clear();
        self.seen.clear();
        self.source_limits.clear();
        self.pending_sources.clear();
        self.yandex_next_page = 1;
        self.yandex_rs.clear();
        self.yandex_exhausted = false;
    }

    pub fn yandex_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.source == "market.yandex.ru")
            .count()
    }
}

/// Process-wide cooldown record for a single source.
#[derive(Debug, Clone)]
pub struct CooldownRecord {
    pub source: String,
    pub until: Instant,
    pub reason: String,
}

/// Response metadata: how many of the requested sources have a settled
/// result, and which ones are still catching up in the background.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMeta {
    pub checked_sources: usize,
    pub total_sources: usize,
    pub pending_sources: Vec<String>,
}

/// The paginated view returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub items: Vec<Item>,
    pub offset: usize,
    pub limit: usize,
    pub next_offset: Option<usize>,
    pub has_more: bool,
    pub checked_sources: usize,
    pub total_sources: usize,
    pub pending_sources: Vec<String>,
}
