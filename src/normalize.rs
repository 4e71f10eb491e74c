use std::collections::HashMap;

use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::QueryTokens;

/// Sources routed through the default list when the caller doesn't specify
/// any, in their canonical order.
pub const DEFAULT_SOURCES: &[&str] = &[
    "market.yandex.ru",
    "mvideo.ru",
    "citilink.ru",
    "eldorado.ru",
    "avito.ru",
    "cdek.shopping",
    "aliexpress.ru",
    "xcom-shop.ru",
];

static DISPLAY_MERCHANT_NAMES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("market.yandex.ru", "Яндекс Маркет"),
        ("aliexpress.ru", "AliExpress"),
        ("wildberries.ru", "Wildberries"),
        ("cdek.shopping", "CDEK Shopping"),
        ("citilink.ru", "Ситилинк"),
        ("xcom-shop.ru", "XCOM-SHOP"),
        ("mvideo.ru", "М.Видео"),
        ("eldorado.ru", "Эльдорадо"),
        ("dns-shop.ru", "DNS"),
        ("avito.ru", "Avito"),
        ("onlinetrade.ru", "Onlinetrade"),
        ("ozon.ru", "Ozon"),
    ])
});

static QUERY_STOPWORDS: Lazy<std::collections::HashSet<&'static str>> = Lazy::new(|| {
    [
        "и", "в", "во", "на", "для", "по", "с", "со", "от", "до", "а", "или", "у", "к", "из",
        "без", "что", "это", "как", "так", "же",
    ]
    .into_iter()
    .collect()
});

static TOKEN_SYNONYMS: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    HashMap::from([
        ("айфон", vec!["iphone"]),
        ("iphone", vec!["айфон"]),
        ("айпад", vec!["ipad"]),
        ("ipad", vec!["айпад"]),
        ("эппл", vec!["apple"]),
        ("эпл", vec!["apple"]),
        ("apple", vec!["эппл", "эпл"]),
        ("самсунг", vec!["samsung"]),
        ("samsung", vec!["самсунг"]),
        ("сяоми", vec!["xiaomi"]),
        ("xiaomi", vec!["сяоми"]),
        ("хуавей", vec!["huawei"]),
        ("huawei", vec!["хуавей"]),
        ("реалми", vec!["realme"]),
        ("realme", vec!["реалми"]),
    ])
});

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]+").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static MERCHANT_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(смартфон|мобильный телефон|сотовый телефон|телефон)\s+").unwrap()
});
/// Drops a comma directly before a memory-variant marker ("Xiaomi, 8/128ГБ"
/// -> "Xiaomi 8/128ГБ").
static COMMA_BEFORE_MEMORY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i),\s*(\d+\s*/\s*\d+\s*гб)").unwrap());
/// Collapses any run of whitespace immediately before "ГБ" to a single space.
static GB_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s+(гб)").unwrap());
/// Matches a bare "б/у" marker (caller is responsible for not re-wrapping an
/// already-parenthesized one, since the `regex` crate has no lookbehind).
static USED_MARKER_BARE: Lazy<Regex> = Lazy::new(|| Regex::new(r",?\s*б/у\b").unwrap());
static MEMORY_VARIANT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b\d+\s*/\s*\d+\s*гб\b").unwrap());

/// Bare-digit alternative used by `first_price`'s currency-adjacent patterns:
/// a grouped (thousands-separated) number, or a plain 2-6 digit run. Stricter
/// than `PRICE_INT_PRICES_SRC` since a 7-digit currency-adjacent number is
/// almost always a phone/SKU digit run rather than a price.
const PRICE_INT_FIRST_SRC: &str = r"\d{1,3}(?:[\s\u{a0}\u{202f}]\d{3})+|\d{2,6}";
/// Bare-digit alternative used by `prices_from_text`: same grouped-number
/// alternative, but a wider 2-7 digit plain run.
const PRICE_INT_PRICES_SRC: &str = r"\d{1,3}(?:[\s\u{a0}\u{202f}]\d{3})+|\d{2,7}";
/// Optional kopeck/cent suffix, consumed but never captured into the price.
const DECIMAL_SUFFIX_SRC: &str = r"(?:[,.]\d{1,2})?";
const CURRENCY_SRC: &str = r"(?:₽|руб\.?|р\.?)";

/// Number immediately followed by a currency marker (word boundary stands in
/// for the original's `(?!\w)`, since `regex` has no lookaround). Group 1
/// captures the integer part only; a trailing decimal suffix is matched but
/// discarded.
static NUMBER_THEN_CURRENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)({}){}\s*{}\b",
        PRICE_INT_FIRST_SRC, DECIMAL_SUFFIX_SRC, CURRENCY_SRC
    ))
    .unwrap()
});
static CURRENCY_THEN_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i){}\s*({}){}\b",
        CURRENCY_SRC, PRICE_INT_FIRST_SRC, DECIMAL_SUFFIX_SRC
    ))
    .unwrap()
});
static GROUPED_OR_LONG_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{1,3}(?:[\s\u{a0}\u{202f}]\d{3})+|\d{4,}").unwrap());
static BARE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{2,6})\b").unwrap());
static PRICE_CONTEXT_SKIP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:/\s*мес|в\s*месяц|в\s*мес|\bмес\b|кредит|рассроч|бонус|балл|кэшб|cashback)")
        .unwrap()
});

/// Lowercases, trims, and collapses whitespace. Used both for the cache key
/// and as the identity law callers can rely on (`normalize_query` is
/// idempotent).
pub fn normalize_query(query: &str) -> String {
    WHITESPACE
        .replace_all(query.trim().to_lowercase().as_str(), " ")
        .into_owned()
}

/// Cleans and de-duplicates a caller-supplied source list, falling back to
/// `DEFAULT_SOURCES` when empty.
pub fn normalize_sources(sources: Option<&[String]>) -> Vec<String> {
    let cleaned: Vec<String> = match sources {
        None => return DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect(),
        Some(list) => list
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
    };
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for s in cleaned {
        if seen.insert(s.clone()) {
            out.push(s);
        }
    }
    if out.is_empty() {
        DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect()
    } else {
        out
    }
}

pub fn cache_key(query: &str, sources: &[String]) -> String {
    let mut sorted = sources.to_vec();
    sorted.sort();
    format!("{}|{}", normalize_query(query), sorted.join(","))
}

pub fn display_merchant_name(source: &str) -> String {
    DISPLAY_MERCHANT_NAMES
        .get(source)
        .map(|s| s.to_string())
        .unwrap_or_else(|| source.to_string())
}

const ZERO_WIDTH_CONTROL: [char; 8] = [
    '\u{200b}', '\u{200c}', '\u{200d}', '\u{200e}', '\u{200f}', '\u{202a}', '\u{202b}', '\u{202c}',
];

/// Cleans a raw title for display: unescapes HTML entities, strips NBSP and
/// zero-width/bidi control characters, collapses whitespace, drops a leading
/// merchant-category prefix, strips a comma before a memory-variant marker
/// and collapses whitespace before "ГБ", normalizes a bare "б/у" into
/// "(б/у)", and truncates to 160 characters on a word boundary.
pub fn clean_title(text: &str) -> String {
    let unescaped = html_escape::decode_html_entities(text);
    let mut t = unescaped.replace('\u{a0}', " ");
    t.retain(|c| c != '\u{2060}' && !ZERO_WIDTH_CONTROL.contains(&c));
    t = WHITESPACE
        .replace_all(
            t.trim_matches(|c: char| c == ' ' || c == ',' || c == ';' || c == '\u{a0}'),
            " ",
        )
        .into_owned();
    t = MERCHANT_PREFIX.replace(&t, "").into_owned();
    t = COMMA_BEFORE_MEMORY.replace_all(&t, " $1").into_owned();
    t = GB_WHITESPACE.replace_all(&t, " $1").into_owned();
    if !t.contains("(б/у)") {
        t = USED_MARKER_BARE.replace_all(&t, " (б/у)").into_owned();
    }
    if t.contains("(б/у") && !t.contains("(б/у)") {
        t = t.replace("(б/у", "(б/у)");
    }
    if t.chars().count() > 160 {
        let truncated: String = t.chars().take(160).collect();
        t = match truncated.rsplit_once(' ') {
            Some((head, _)) => head.to_string(),
            None => truncated,
        };
    }
    t
}

/// AliExpress listings frequently enumerate several memory variants
/// ("8/128ГБ 8/256ГБ ..."); keep only the first so the title doesn't read as
/// a wall of text.
pub fn clean_ali_title(text: &str) -> String {
    let t = clean_title(text);
    let mems: Vec<&str> = MEMORY_VARIANT.find_iter(&t).map(|m| m.as_str()).collect();
    let mut result = t;
    if mems.len() > 1 {
        let first = mems[0].to_string();
        let stripped = MEMORY_VARIANT.replace_all(&result, "").trim().to_string();
        let stripped = WHITESPACE.replace_all(&stripped, " ").to_string();
        result = if stripped.contains("(б/у)") {
            let trailing = Regex::new(r"\s*\(б/у\)\s*$").unwrap();
            trailing
                .replace(&stripped, format!(" {} (б/у)", first))
                .into_owned()
        } else {
            format!("{} {}", stripped, first).trim().to_string()
        };
        result = WHITESPACE.replace_all(&result, " ").trim().to_string();
    }
    let result = Regex::new(r"\s+\(").unwrap().replace_all(&result, " (").into_owned();
    let result = Regex::new(r"\(\s+").unwrap().replace_all(&result, "(").into_owned();
    result
}

fn clean_for_price(text: &str) -> String {
    let unescaped = html_escape::decode_html_entities(text);
    let t = unescaped
        .replace('\u{a0}', " ")
        .replace('\u{202f}', " ")
        .replace('\u{2009}', " ");
    WHITESPACE.replace_all(t.trim(), " ").into_owned()
}

fn digits_in_range(s: &str) -> Option<i64> {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let val: i64 = digits.parse().ok()?;
    if (10..=1_000_000).contains(&val) {
        Some(val)
    } else {
        None
    }
}

/// Best single price adjacent to a currency marker; falls back to the
/// longest grouped number, then any 2-6 digit standalone number.
pub fn first_price(text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    let t = clean_for_price(text);

    if let Some(caps) = NUMBER_THEN_CURRENCY.captures(&t) {
        if let Some(val) = digits_in_range(&caps[1]) {
            return val;
        }
    }
    if let Some(caps) = CURRENCY_THEN_NUMBER.captures(&t) {
        if let Some(val) = digits_in_range(&caps[1]) {
            return val;
        }
    }
    for m in GROUPED_OR_LONG_NUMBER.find_iter(&t) {
        if let Some(val) = digits_in_range(m.as_str()) {
            return val;
        }
    }
    if let Some(caps) = BARE_NUMBER.captures(&t) {
        return caps[1].parse().unwrap_or(0);
    }
    0
}

/// All prices in free text that sit next to a currency marker and whose
/// surrounding context doesn't look like an installment/cashback mention.
pub fn prices_from_text(text: &str) -> Vec<i64> {
    if text.is_empty() {
        return Vec::new();
    }
    let t = clean_for_price(text);
    if t.is_empty() {
        return Vec::new();
    }
    let pattern = Regex::new(&format!(r"(?i)(?:{})\s*{}", PRICE_INT_PRICES_SRC, CURRENCY_SRC)).unwrap();
    let mut out = Vec::new();
    for m in pattern.find_iter(&t) {
        let start = m.start().saturating_sub(16);
        let end = (m.end() + 16).min(t.len());
        let context = &t[start..end];
        if PRICE_CONTEXT_SKIP.is_match(context) {
            continue;
        }
        if let Some(val) = digits_in_range(m.as_str()) {
            out.push(val);
        }
    }
    out
}

pub fn best_price_from_text(text: &str) -> i64 {
    prices_from_text(text).into_iter().max().unwrap_or(0)
}

/// Clamps to `[10, 1_000_000]`, returning 0 (unknown) for anything outside
/// that range. Idempotent.
pub fn normalize_price(value: i64) -> i64 {
    if (10..=1_000_000).contains(&value) {
        value
    } else {
        0
    }
}

/// First usable absolute URL among candidates: `data:` URIs are skipped,
/// protocol-relative URLs are promoted to `https:`.
pub fn first_http_url(candidates: &[&str]) -> String {
    for candidate in candidates {
        let c = candidate.trim();
        if c.is_empty() || c.starts_with("data:") {
            continue;
        }
        if let Some(rest) = c.strip_prefix("//") {
            return format!("https:{}", rest);
        }
        if c.starts_with("http://") || c.starts_with("https://") {
            return c.to_string();
        }
    }
    String::new()
}

/// Resolves a possibly-relative `href` against `base`.
pub fn abs_url(base: &str, href: &str) -> String {
    let href = href.trim();
    if href.is_empty() {
        return String::new();
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(rest) = href.strip_prefix("//") {
        return format!("https:{}", rest);
    }
    match url::Url::parse(base).and_then(|b| b.join(href)) {
        Ok(joined) => joined.to_string(),
        Err(_) => String::new(),
    }
}

/// Stable synthetic ID for a source that doesn't give us one: first 12 hex
/// chars of the MD5 of the input (normally the product URL).
pub fn stable_item_id(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let digest = Md5::digest(value.as_bytes());
    hex_prefix(&digest, 12)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut s = String::with_capacity(len);
    for byte in bytes {
        if s.len() >= len {
            break;
        }
        s.push_str(&format!("{:02x}", byte));
    }
    s.truncate(len);
    s
}

/// Tokenizes a query: lowercase, `ё`→`е`, non-word runs become spaces,
/// stopwords and single-character tokens dropped, de-duplicated in order,
/// capped at 10.
pub fn query_tokens(query: &str) -> QueryTokens {
    let q = query.trim().to_lowercase().replace('ё', "е");
    let q = NON_WORD.replace_all(&q, " ");
    let q = WHITESPACE.replace_all(q.trim(), " ");

    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for token in q.split(' ').filter(|t| !t.is_empty()) {
        if QUERY_STOPWORDS.contains(token) {
            continue;
        }
        if token.chars().count() <= 1 {
            continue;
        }
        if seen.insert(token.to_string()) {
            out.push(token.to_string());
            if out.len() >= 10 {
                break;
            }
        }
    }
    QueryTokens { tokens: out }
}

/// Minimum number of distinct tokens (by synonym-aware substring match) that
/// must be present in a title for it to count as relevant. 1 for a single
/// token, 2 for two, `max(2, ceil(0.6·N))` beyond that.
fn required_hits(token_count: usize) -> usize {
    match token_count {
        0 => 0,
        1 => 1,
        2 => 2,
        n => std::cmp::max(2, (n * 6 + 9) / 10),
    }
}

/// Whether `title` is relevant to `tokens`, honoring the Russian/English
/// synonym sets. An empty token list always matches.
pub fn matches_query(title: &str, tokens: &QueryTokens) -> bool {
    if tokens.is_empty() {
        return true;
    }
    let t = title.trim().to_lowercase().replace('ё', "е");
    if t.is_empty() {
        return false;
    }
    let mut hits = 0;
    for token in &tokens.tokens {
        let mut variants = vec![token.as_str()];
        if let Some(synonyms) = TOKEN_SYNONYMS.get(token.as_str()) {
            variants.extend(synonyms.iter().copied());
        }
        if variants.iter().any(|v| !v.is_empty() && t.contains(v)) {
            hits += 1;
        }
    }
    hits >= required_hits(tokens.len())
}

/// First non-`data:` image URL among an ordered list of lazy-load attribute
/// candidates, falling back to the first `srcset` entry.
pub fn img_url(candidates: &[Option<&str>], srcset: Option<&str>) -> String {
    let mut owned: Vec<&str> = candidates.iter().filter_map(|c| *c).collect();
    let first_srcset = srcset.and_then(|s| s.split_whitespace().next());
    if let Some(first) = first_srcset {
        owned.push(first);
    }
    first_http_url(&owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_query_idempotent() {
        let once = normalize_query("  Iphone   15  ");
        let twice = normalize_query(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "iphone 15");
    }

    #[test]
    fn normalize_price_range_and_idempotence() {
        assert_eq!(normalize_price(5), 0);
        assert_eq!(normalize_price(1_000_001), 0);
        assert_eq!(normalize_price(79_990), 79_990);
        assert_eq!(normalize_price(normalize_price(79_990)), 79_990);
    }

    #[test]
    fn clean_title_strips_control_chars_and_prefix() {
        let cleaned = clean_title("Смартфон iPhone 15\u{200b}\u{a0}б/у");
        assert_eq!(cleaned, "iPhone 15 (б/у)");
        assert!(cleaned.len() <= 160);
    }

    #[test]
    fn clean_title_strips_comma_before_memory_variant_and_collapses_gb_whitespace() {
        assert_eq!(clean_title("Xiaomi, 8/128ГБ"), "Xiaomi 8/128ГБ");
        assert_eq!(clean_title("Xiaomi 8/128   ГБ"), "Xiaomi 8/128 ГБ");
    }

    #[test]
    fn clean_title_truncates_on_word_boundary() {
        let long = "слово ".repeat(40);
        let cleaned = clean_title(&long);
        assert!(cleaned.chars().count() <= 160);
        assert!(!cleaned.ends_with(' '));
    }

    #[test]
    fn token_match_requires_both_tokens_for_two() {
        let tokens = query_tokens("iphone 15");
        assert_eq!(tokens.tokens, vec!["iphone", "15"]);
        assert!(matches_query("Смартфон Apple iPhone 15 128GB", &tokens));
        assert!(!matches_query("Samsung Galaxy S24", &tokens));
    }

    #[test]
    fn token_match_accepts_synonyms() {
        let tokens = query_tokens("айфон 15");
        assert!(matches_query("iPhone 15 Pro", &tokens));
    }

    #[test]
    fn required_hits_matches_spec_formula() {
        assert_eq!(required_hits(1), 1);
        assert_eq!(required_hits(2), 2);
        assert_eq!(required_hits(3), 2);
        assert_eq!(required_hits(4), 3);
        assert_eq!(required_hits(10), 6);
    }

    #[test]
    fn first_price_prefers_currency_adjacent_number() {
        assert_eq!(first_price("Чехол A3526 79 990 ₽"), 79_990);
    }

    #[test]
    fn price_context_skip_excludes_installments() {
        let prices = prices_from_text("15000 ₽ сейчас, 3000 руб в месяц по кредиту");
        assert_eq!(prices, vec![15_000]);
    }

    #[test]
    fn first_price_ignores_kopeck_suffix() {
        assert_eq!(first_price("Телефон 1 990,50 ₽"), 1_990);
        assert_eq!(first_price("руб. 45990.99 за штуку"), 45_990);
    }

    #[test]
    fn stable_item_id_is_deterministic() {
        let a = stable_item_id("https://example.com/item/1");
        let b = stable_item_id("https://example.com/item/1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn ali_title_keeps_first_memory_variant() {
        let cleaned = clean_ali_title("Смартфон Xiaomi 8/128ГБ 8/256ГБ 12/256ГБ б/у");
        assert_eq!(cleaned.matches("ГБ").count(), 1);
    }
}
