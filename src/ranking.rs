use std::cmp::Ordering;

use crate::adapters::YANDEX_MAX_PAGES;
use crate::model::{CacheEntryState, Item};

/// A single page of results plus whether the caller should expect more on
/// the next offset.
pub struct PageView {
    pub items: Vec<Item>,
    pub has_more: bool,
}

/// Ascending by price (unknown prices, encoded as 0, sort last), then by
/// source name, then by id — a total order so pagination is stable across
/// calls into the same cache entry.
pub fn sort_key(a: &Item, b: &Item) -> Ordering {
    let price_a = if a.price > 0 { a.price } else { i64::MAX };
    let price_b = if b.price > 0 { b.price } else { i64::MAX };
    price_a
        .cmp(&price_b)
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.id.cmp(&b.id))
}

/// Slices the entry's (already sorted) items into the requested page.
///
/// In global-merge mode (`per_source == false`) this is a plain offset/limit
/// slice over the merged, price-sorted list. In per-source mode, each
/// source's items are paginated independently in `sources` order and then
/// re-merged by price, so a slow source landing late in the order doesn't
/// starve a fast one out of the page.
pub fn paginate(
    state: &CacheEntryState,
    sources: &[String],
    offset: usize,
    limit: usize,
    per_source: bool,
    partial: bool,
) -> PageView {
    let has_pending = !state.pending_sources.is_empty() && partial;

    if !per_source {
        let total = state.items.len();
        let items = if offset >= total {
            Vec::new()
        } else {
            state.items[offset..total.min(offset + limit)].to_vec()
        };
        let yandex_more = sources.iter().any(|s| s == "market.yandex.ru")
            && !state.yandex_exhausted
            && state.yandex_next_page <= YANDEX_MAX_PAGES;
        let has_more = offset + items.len() < total || yandex_more || has_pending;
        return PageView { items, has_more };
    }

    let mut any_group_reaches_page_end = false;
    let mut merged: Vec<Item> = Vec::new();
    for source in sources {
        let group: Vec<&Item> = state.items.iter().filter(|item| &item.source == source).collect();
        if group.len() >= offset + limit {
            any_group_reaches_page_end = true;
        }
        let slice = if offset >= group.len() {
            Vec::new()
        } else {
            group[offset..group.len().min(offset + limit)].to_vec()
        };
        merged.extend(slice.into_iter().cloned());
    }
    merged.sort_by(sort_key);

    let yandex_more = sources.iter().any(|s| s == "market.yandex.ru")
        && !state.yandex_exhausted
        && state.yandex_next_page <= YANDEX_MAX_PAGES;
    let has_more = any_group_reaches_page_end || yandex_more || has_pending;

    PageView { items: merged, has_more }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn item(source: &str, id: &str, price: i64) -> Item {
        Item {
            id: id.to_string(),
            title: format!("item {}", id),
            price,
            thumbnail_url: String::new(),
            product_url: String::new(),
            source: source.to_string(),
            merchant_name: String::new(),
            merchant_logo_url: String::new(),
        }
    }

    fn state_with(items: Vec<Item>) -> CacheEntryState {
        let mut state = CacheEntryState::fresh(Instant::now(), Duration::from_secs(600));
        state.items = items;
        state
    }

    #[test]
    fn sort_key_pushes_unknown_price_to_the_end() {
        let mut items = vec![item("a", "1", 0), item("a", "2", 500), item("a", "3", 100)];
        items.sort_by(sort_key);
        let prices: Vec<i64> = items.iter().map(|i| i.price).collect();
        assert_eq!(prices, vec![100, 500, 0]);
    }

    #[test]
    fn global_merge_pagination_slices_by_offset() {
        let items = vec![item("a", "1", 100), item("a", "2", 200), item("a", "3", 300)];
        let state = state_with(items);
        let view = paginate(&state, &["a".to_string()], 1, 1, false, false);
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.items[0].id, "2");
        assert!(view.has_more);
    }

    #[test]
    fn per_source_pagination_merges_each_source_slice() {
        let items = vec![
            item("a", "1", 100),
            item("a", "2", 900),
            item("b", "1", 200),
            item("b", "2", 300),
        ];
        let state = state_with(items);
        let view = paginate(&state, &["a".to_string(), "b".to_string()], 0, 1, true, false);
        assert_eq!(view.items.len(), 2);
        assert_eq!(view.items[0].source, "a");
        assert_eq!(view.items[1].source, "b");
    }

    #[test]
    fn exhausted_yandex_does_not_force_has_more() {
        let items = vec![item("market.yandex.ru", "1", 100)];
        let mut state = state_with(items);
        state.yandex_exhausted = true;
        let view = paginate(&state, &["market.yandex.ru".to_string()], 0, 10, false, false);
        assert!(!view.has_more);
    }
}
