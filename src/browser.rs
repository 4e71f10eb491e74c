use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;

/// Stealth script evaluated against every rendered page: neutralizes
/// `navigator.webdriver`, backfills `languages`/`plugins`, and installs a
/// minimal `chrome` object so naive fingerprint checks don't trip.
const STEALTH_INIT_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', {get: () => undefined});
window.chrome = window.chrome || { runtime: {} };
Object.defineProperty(navigator, 'languages', {get: () => ['ru-RU', 'ru', 'en-US', 'en']});
Object.defineProperty(navigator, 'plugins', {get: () => [1, 2, 3, 4, 5]});
"#;

const MAX_CONCURRENT_RENDERS: usize = 2;

/// Outcome of a single `render()` call. On a navigation timeout the partial
/// DOM is still returned rather than treated as a hard failure.
pub struct RenderResult {
    pub html: String,
    pub title: String,
    pub final_url: String,
    pub error: Option<String>,
}

impl RenderResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            html: String::new(),
            title: String::new(),
            final_url: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Options accepted by `render`, mirroring the fallback-browser contract in
/// the design: headless toggle, scroll stepping, a prewarm navigation, and
/// extra headers merged over the default `Accept-Language`.
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub headless: Option<bool>,
    pub scroll: bool,
    pub scroll_times: u32,
    pub scroll_pause: Duration,
    pub prewarm_url: Option<String>,
    pub extra_headers: Vec<(String, String)>,
}

/// Bounded-concurrency wrapper around a single shared browser process.
/// Guarantees at most `MAX_CONCURRENT_RENDERS` renders in flight at once via
/// a semaphore; each render opens and tears down its own page.
pub struct BrowserGateway {
    config: EngineConfig,
    browser: Mutex<Option<Arc<Browser>>>,
    semaphore: Arc<Semaphore>,
}

impl BrowserGateway {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            browser: Mutex::new(None),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_RENDERS)),
        }
    }

    async fn acquire_browser(&self) -> anyhow::Result<Arc<Browser>> {
        let mut guard = self.browser.lock().await;
        if let Some(browser) = guard.as_ref() {
            return Ok(browser.clone());
        }

        debug!("browser gateway: launching headless engine");
        let mut builder = BrowserConfig::builder();
        let headless = self.config.browser_headless;
        if headless {
            builder = builder.arg("--headless=new");
        }
        if !self.config.browser_executable_path.is_empty() {
            builder = builder.chrome_executable(self.config.browser_executable_path.clone());
        }
        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--enable-automation")
            .arg("--disable-popup-blocking")
            .arg("--disable-component-update")
            .arg("--disable-default-apps")
            .arg("--disable-extensions")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--mute-audio")
            .arg("--no-first-run");
        if !self.config.browser_proxy_url.is_empty() && self.config.browser_proxy_all {
            builder = builder.arg(format!("--proxy-server={}", self.config.browser_proxy_url));
        }
        for arg in self.config.browser_extra_arg_list() {
            builder = builder.arg(arg);
        }

        let browser_config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("browser config: {}", e))?;
        let (browser, mut handler) = Browser::launch(browser_config).await?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("browser gateway: cdp handler error: {}", e);
                }
            }
            debug!("browser gateway: cdp handler exited");
        });

        let browser = Arc::new(browser);
        *guard = Some(browser.clone());
        Ok(browser)
    }

    /// Renders `url` in a fresh tab: navigates, optionally prewarms, waits
    /// for `wait_for_selector` up to `wait_seconds`, scrolls in steps when
    /// requested, and returns the resulting DOM. A navigation timeout still
    /// yields whatever DOM is present rather than failing outright.
    pub async fn render(
        &self,
        provider: &str,
        url: &str,
        wait_for_selector: Option<&str>,
        wait_seconds: f64,
        options: &RenderOptions,
    ) -> RenderResult {
        let permit = match self.semaphore.acquire().await {
            Ok(p) => p,
            Err(_) => return RenderResult::failed("browser semaphore closed"),
        };

        let browser = match self.acquire_browser().await {
            Ok(b) => b,
            Err(e) => {
                drop(permit);
                return RenderResult::failed(e.to_string());
            }
        };

        let nav_timeout = Duration::from_secs_f64(
            wait_seconds.clamp(5.0, self.config.search_timeout_seconds as f64).max(5.0),
        );

        let page = match browser.new_page("about:blank").await {
            Ok(p) => p,
            Err(e) => {
                drop(permit);
                return RenderResult::failed(format!("failed to open tab: {}", e));
            }
        };

        if let Some(prewarm) = &options.prewarm_url {
            let _ = tokio::time::timeout(nav_timeout, page.goto(prewarm.as_str())).await;
        }

        let goto_outcome = tokio::time::timeout(nav_timeout, page.goto(url)).await;
        let timed_out = goto_outcome.is_err();
        if timed_out {
            warn!("{}: navigation timed out after {:?}, returning partial DOM", provider, nav_timeout);
        }

        if let Err(e) = page.evaluate(STEALTH_INIT_SCRIPT).await {
            warn!("{}: stealth init script failed: {}", provider, e);
        }

        if let Some(selector) = wait_for_selector {
            let wait = Duration::from_secs_f64(wait_seconds.max(1.0));
            let _ = tokio::time::timeout(wait, page.find_element(selector)).await;
        }

        if options.scroll {
            if let Ok(height_value) = page
                .evaluate("document.body ? document.body.scrollHeight : 0")
                .await
                .and_then(|v| v.into_value::<i64>().map_err(Into::into))
            {
                let times = options.scroll_times.max(1);
                let step = (height_value / (times as i64 + 1)).max(900);
                let mut y: i64 = 0;
                for _ in 0..times {
                    y += step;
                    let _ = page.evaluate(format!("window.scrollTo(0, {})", y)).await;
                    tokio::time::sleep(options.scroll_pause.max(Duration::from_millis(100))).await;
                }
            }
        }

        let html = page.content().await.unwrap_or_default();
        let title = match page.evaluate("document.title").await {
            Ok(value) => value.into_value::<String>().unwrap_or_default(),
            Err(_) => String::new(),
        };
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());

        let _ = page.close().await;
        drop(permit);

        info!("{}: rendered in headless engine (title={:?})", provider, title);
        RenderResult {
            html,
            title,
            final_url,
            error: if timed_out { Some("navigation timeout".to_string()) } else { None },
        }
    }

    pub async fn shutdown(&self) {
        let mut guard = self.browser.lock().await;
        if let Some(mut browser) = guard.take().and_then(|b| Arc::try_unwrap(b).ok()) {
            let _ = browser.close().await;
            debug!("browser gateway: shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scroll_step_is_at_least_900px() {
        let height: i64 = 1200;
        let times = 3i64;
        let step = (height / (times + 1)).max(900);
        assert_eq!(step, 900);

        let tall: i64 = 8000;
        let step_tall = (tall / (times + 1)).max(900);
        assert_eq!(step_tall, 2000);
    }

    #[test]
    fn semaphore_caps_at_two_concurrent_renders() {
        let gateway = BrowserGateway::new(EngineConfig::default());
        assert_eq!(gateway.semaphore.available_permits(), MAX_CONCURRENT_RENDERS);
    }
}
