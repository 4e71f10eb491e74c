use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use moka::future::Cache;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;

/// Raw-body cache keyed by the request URL: absorbs repeated fetches of the
/// same page within a short window (e.g. a straggler retry racing a fresh
/// call for the same query) without needing to touch the query cache.
const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(30);
const RESPONSE_CACHE_CAPACITY: u64 = 2_000;

const MAX_RETRIES: u32 = 2;
const RETRY_BASE_DELAY_MS: u64 = 150;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/123.0.6312.105 Safari/537.36";
const AVITO_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

static BLOCK_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(вы\s+робот|подтвердите.*человек|доступ.*ограничен|капч|captcha|cloudflare|access denied|forbidden|qrator|qauth|проверяем\s+браузер|почти\s+готово)",
    )
    .unwrap()
});

static TITLE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static COLLAPSE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Outcome of a single fetch attempt.
#[derive(Clone)]
pub struct FetchResult {
    pub status: u16,
    pub html: String,
    pub title: String,
    pub final_url: String,
    pub error: Option<String>,
}

impl FetchResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: 0,
            html: String::new(),
            title: String::new(),
            final_url: String::new(),
            error: Some(error.into()),
        }
    }
}

/// One pooled client per distinct outbound proxy URL. Mirrors the original's
/// per-proxy `httpx.AsyncClient` cache: most sources share the direct
/// (no-proxy) client, a handful get routed through a proxy.
pub struct FetchClientPool {
    clients: Mutex<HashMap<String, Client>>,
    response_cache: Cache<String, Arc<FetchResult>>,
    config: EngineConfig,
}

impl FetchClientPool {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            response_cache: Cache::builder()
                .time_to_live(RESPONSE_CACHE_TTL)
                .max_capacity(RESPONSE_CACHE_CAPACITY)
                .build(),
            config,
        }
    }

    async fn client_for(&self, proxy_url: &str) -> Result<Client> {
        let key = normalize_proxy_url(proxy_url);
        if let Some(client) = self.clients.lock().await.get(&key) {
            return Ok(client.clone());
        }
        let mut guard = self.clients.lock().await;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        if !key.is_empty() {
            info!("fetch client pool: proxy enabled ({})", proxy_brief(&key));
        }
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(self.config.search_timeout_seconds))
            .pool_max_idle_per_host(10)
            .redirect(reqwest::redirect::Policy::limited(10));
        if !key.is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(key.as_str())?);
        }
        let client = builder.build()?;
        guard.insert(key, client.clone());
        Ok(client)
    }

    /// Resolves the provider's preferred proxy per the allow-list rules in
    /// the engine configuration.
    pub fn proxy_for(&self, provider: &str) -> String {
        http_proxy_for(provider, &self.config)
    }

    /// Performs a GET and decodes the body, extracting `<title>` and the
    /// final (post-redirect) URL. A failure (network error, decode error)
    /// yields an empty `html` and a populated `error`, never an `Err` — the
    /// caller's failure semantics treat a transient fetch failure as "no
    /// items", not a hard error.
    pub async fn get(&self, provider: &str, url: &str) -> FetchResult {
        if let Some(cached) = self.response_cache.get(url).await {
            debug!("{}: served from response cache", provider);
            return (*cached).clone();
        }

        let proxy = self.proxy_for(provider);
        let client = match self.client_for(&proxy).await {
            Ok(c) => c,
            Err(e) => return FetchResult::failed(e.to_string()),
        };

        let mut attempt = 0;
        let result = loop {
            match self.send_once(provider, url, &client).await {
                Ok(result) => break result,
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        warn!("{}: request failed after {} attempt(s): {}", provider, attempt + 1, e);
                        break FetchResult::failed(e.to_string());
                    }
                    let jitter_ms = rand::thread_rng().gen_range(0..RETRY_BASE_DELAY_MS);
                    let delay = Duration::from_millis(RETRY_BASE_DELAY_MS * (1 << attempt) + jitter_ms);
                    debug!("{}: retrying after {:?} ({})", provider, delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        if result.error.is_none() && !result.html.is_empty() {
            self.response_cache.insert(url.to_string(), Arc::new(result.clone())).await;
        }
        result
    }

    async fn send_once(&self, provider: &str, url: &str, client: &Client) -> Result<FetchResult> {
        let user_agent = user_agent_for(provider);
        let mut request = client
            .get(url)
            .header("User-Agent", user_agent)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header("Accept-Language", "ru-RU,ru;q=0.9,en;q=0.8")
            .header("Accept-Encoding", "gzip, deflate");
        if provider_base(provider) == "dns-shop.ru" && !self.config.dns_cookie.is_empty() {
            request = request.header("Cookie", self.config.dns_cookie.clone());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        match response.text().await {
            Ok(body) => {
                let title = html_title(&body);
                Ok(FetchResult {
                    status,
                    html: body,
                    title,
                    final_url,
                    error: None,
                })
            }
            Err(e) => {
                warn!("{}: failed to decode response body: {}", provider, e);
                Ok(FetchResult {
                    status,
                    html: String::new(),
                    title: String::new(),
                    final_url,
                    error: Some(e.to_string()),
                })
            }
        }
    }
}

fn provider_base(provider: &str) -> &str {
    provider.split(':').next().unwrap_or(provider).trim()
}

fn user_agent_for(provider: &str) -> &'static str {
    if provider_base(provider) == "avito.ru" {
        AVITO_USER_AGENT
    } else {
        USER_AGENT
    }
}

/// Providers whose browser-routed traffic prefers the browser proxy over the
/// general HTTP proxy when both are configured.
const BROWSER_PROXY_PREFERRED: &[&str] = &["avito.ru", "wildberries.ru", "onlinetrade.ru", "ozon.ru"];

fn http_proxy_for(provider: &str, config: &EngineConfig) -> String {
    let base = provider_base(provider);
    if base == "eldorado.ru" {
        if !config.eldorado_proxy_url.is_empty() {
            return config.eldorado_proxy_url.clone();
        }
        return config.browser_proxy_url.clone();
    }
    if BROWSER_PROXY_PREFERRED.contains(&base) && !config.browser_proxy_url.is_empty() {
        return config.browser_proxy_url.clone();
    }
    let allow_list = config.proxy_source_list();
    if allow_list.iter().any(|s| s == base) {
        return config.http_proxy_url.clone();
    }
    String::new()
}

fn normalize_proxy_url(proxy_url: &str) -> String {
    let u = proxy_url.trim();
    if u.is_empty() {
        return String::new();
    }
    match url::Url::parse(u) {
        Ok(parsed) => {
            if parsed.host_str().is_none() || parsed.port_or_known_default().is_none() {
                return u.to_string();
            }
            let scheme = if parsed.scheme() == "https" { "http" } else { parsed.scheme() };
            let mut out = format!("{}://", scheme);
            if !parsed.username().is_empty() {
                out.push_str(parsed.username());
                if let Some(pass) = parsed.password() {
                    out.push(':');
                    out.push_str(pass);
                }
                out.push('@');
            }
            out.push_str(parsed.host_str().unwrap_or_default());
            out.push(':');
            out.push_str(&parsed.port_or_known_default().unwrap_or(80).to_string());
            out
        }
        Err(_) => u.to_string(),
    }
}

fn proxy_brief(proxy_url: &str) -> String {
    match url::Url::parse(proxy_url) {
        Ok(parsed) => format!(
            "{}://{}:{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or("?"),
            parsed.port_or_known_default().unwrap_or(0)
        ),
        Err(_) => "?".to_string(),
    }
}

pub fn html_title(html: &str) -> String {
    match TITLE_TAG.captures(html) {
        None => String::new(),
        Some(caps) => {
            let raw = html_escape::decode_html_entities(&caps[1]);
            COLLAPSE_WS.replace_all(raw.trim(), " ").into_owned()
        }
    }
}

pub fn looks_like_block_page(title: &str, html: &str) -> bool {
    if title.is_empty() && html.is_empty() {
        return false;
    }
    if BLOCK_MARKERS.is_match(title) {
        return true;
    }
    let head: String = html.chars().take(20_000).collect();
    BLOCK_MARKERS.is_match(&head)
}

pub fn is_avito_ip_block(status: Option<u16>, title: &str, html: &str) -> bool {
    match status {
        Some(401) | Some(403) => {}
        _ => return false,
    }
    let t = title.to_lowercase();
    let h = html.to_lowercase();
    t.contains("проблема с ip")
        || t.contains("доступ ограничен")
        || h.contains("проблема с ip")
        || h.contains("доступ ограничен")
}
