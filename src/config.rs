use serde::{Deserialize, Serialize};

/// Engine-wide configuration, recognized by the orchestrator, the fetch client
/// pool, and the browser gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Envelope used both as the HTTP client default timeout and as the
    /// single-source search deadline floor.
    #[serde(default = "default_search_timeout")]
    pub search_timeout_seconds: u64,

    /// Proxy URL for providers that go through plain HTTP (CSV allow-list
    /// controlled by `proxy_sources`).
    #[serde(default)]
    pub http_proxy_url: String,

    /// Proxy URL for providers that require the browser gateway.
    #[serde(default)]
    pub browser_proxy_url: String,

    /// Proxy URL override for `eldorado.ru`, which replaces the browser
    /// (Selenium) proxy when set rather than layering on top of it.
    #[serde(default)]
    pub eldorado_proxy_url: String,

    /// CSV of source names that should be routed through `http_proxy_url`.
    #[serde(default)]
    pub proxy_sources: String,

    /// Cookie header value required by some sources to pass anti-bot checks.
    #[serde(default)]
    pub dns_cookie: String,

    /// Run the browser gateway headless.
    #[serde(default = "default_true")]
    pub browser_headless: bool,

    /// CSV of extra browser launch arguments.
    #[serde(default)]
    pub browser_extra_args: String,

    /// Route every browser-gateway request through `browser_proxy_url`,
    /// regardless of the per-source allow-list.
    #[serde(default)]
    pub browser_proxy_all: bool,

    /// Path to a custom Chromium/Chrome binary.
    #[serde(default)]
    pub browser_executable_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            search_timeout_seconds: default_search_timeout(),
            http_proxy_url: String::new(),
            browser_proxy_url: String::new(),
            eldorado_proxy_url: String::new(),
            proxy_sources: String::new(),
            dns_cookie: String::new(),
            browser_headless: true,
            browser_extra_args: String::new(),
            browser_proxy_all: false,
            browser_executable_path: String::new(),
        }
    }
}

impl EngineConfig {
    /// Sources that should be routed through `http_proxy_url`, in CSV order,
    /// trimmed and with empties dropped.
    pub fn proxy_source_list(&self) -> Vec<String> {
        self.proxy_sources
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Extra browser launch args, trimmed and with empties dropped.
    pub fn browser_extra_arg_list(&self) -> Vec<String> {
        self.browser_extra_args
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn default_true() -> bool {
    true
}

fn default_search_timeout() -> u64 {
    35
}
