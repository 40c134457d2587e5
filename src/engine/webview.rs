//! WebView Backend - DOM-backed extraction for `action: loadUrl` modules
//!
//! The controller is a capability trait: load a URL, wait for it, evaluate
//! a script, hand back JSON. The backend adds what every site needs on top:
//! rate limiting, a Cloudflare interstitial wait (passive challenges clear
//! on their own; Turnstile means a human is required and the operation
//! fails fast), extraction-script execution and `__error` decoding.
//!
//! An optional headless-Chrome controller ships behind the `webview`
//! feature flag, with a stub otherwise.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::debug::{DebugScope, DebugStep, StepType};
use super::rate_limit::{parse_rate_limit, RateLimiter};
use super::utils::host_of;
use crate::error::{ErrorContext, ReaderError, ReaderResult};
use crate::models::Source;

/// Sub-resource request hook: record and decide. Returning `false` blocks
/// the request inside controllers that support interception.
pub type RequestHook = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// One rendered page. Controllers are exclusive to a single extraction call
/// and disposed on every exit path.
///
/// `evaluate_javascript` receives a *function body* with a top-level
/// `return`; implementations wrap it for their engine (IIFE for Chrome).
#[async_trait]
pub trait WebViewController: Send + Sync {
    async fn load_url(&self, url: &str) -> anyhow::Result<bool>;
    async fn wait_for_load(&self) -> anyhow::Result<bool>;
    async fn evaluate_javascript(&self, script: &str) -> anyhow::Result<serde_json::Value>;
    async fn get_html(&self) -> anyhow::Result<String>;
    fn set_custom_user_agent(&self, _user_agent: &str) {}
    fn install_request_hook(&self, _hook: RequestHook) {}
    fn dispose(&self);
}

/// Factory for controllers; the engine creates one per extraction.
pub trait WebViewProvider: Send + Sync {
    fn create(&self) -> anyhow::Result<Box<dyn WebViewController>>;
}

const CF_POLL_INTERVAL: Duration = Duration::from_millis(500);
const CF_MAX_WAIT: Duration = Duration::from_secs(15);
const CF_MAX_EVAL_ERRORS: u32 = 3;

/// In-page probe for Cloudflare interstitial signals.
const CF_DETECT_SCRIPT: &str = r#"
var body = document.body ? (document.body.innerText || '') : '';
return {
  title: document.title || '',
  hasChallengeForm: !!document.querySelector('#challenge-form'),
  hasCdnCgi: !!document.querySelector('script[src*="cdn-cgi"], iframe[src*="cdn-cgi"]')
    || location.pathname.indexOf('cdn-cgi') !== -1,
  hasTurnstile: !!document.querySelector('.cf-turnstile, iframe[src*="challenges.cloudflare.com"]'),
  bodyPreview: body.slice(0, 200)
};
"#;

#[derive(Debug, Default)]
struct CfSignals {
    title: String,
    has_challenge_form: bool,
    has_cdn_cgi: bool,
    has_turnstile: bool,
    body_preview: String,
}

impl CfSignals {
    fn from_json(value: &serde_json::Value) -> Self {
        Self {
            title: value["title"].as_str().unwrap_or_default().to_string(),
            has_challenge_form: value["hasChallengeForm"].as_bool().unwrap_or(false),
            has_cdn_cgi: value["hasCdnCgi"].as_bool().unwrap_or(false),
            has_turnstile: value["hasTurnstile"].as_bool().unwrap_or(false),
            body_preview: value["bodyPreview"].as_str().unwrap_or_default().to_string(),
        }
    }

    fn title_matches_wait(&self) -> bool {
        let title = self.title.to_lowercase();
        title.contains("just a moment")
            || title.contains("attention required")
            || self.title.contains("请稍候")
    }

    fn body_matches_checking(&self) -> bool {
        let body = self.body_preview.to_lowercase();
        body.contains("checking your browser")
            || body.contains("verify you are human")
            || self.body_preview.contains("正在检查您的浏览器")
    }

    fn is_challenge(&self) -> bool {
        self.has_challenge_form
            || self.has_cdn_cgi
            || self.has_turnstile
            || (self.title_matches_wait() && self.body_matches_checking())
    }

    fn is_interactive(&self) -> bool {
        self.has_turnstile
    }
}

/// Poll the page until the interstitial clears. A Turnstile widget fails
/// immediately; a passive challenge gets up to `min(15s, remaining)`.
/// Three consecutive probe errors abort the wait gracefully.
async fn cloudflare_wait(
    controller: &dyn WebViewController,
    deadline: Instant,
    url: &str,
    dbg: &DebugScope,
) -> ReaderResult<()> {
    let wait_deadline = Instant::now()
        .checked_add(CF_MAX_WAIT)
        .map(|cap| cap.min(deadline))
        .unwrap_or(deadline);
    let mut was_challenged = false;
    let mut eval_errors = 0u32;

    loop {
        let signals = match controller.evaluate_javascript(CF_DETECT_SCRIPT).await {
            Ok(value) => CfSignals::from_json(&value),
            Err(e) => {
                eval_errors += 1;
                tracing::debug!(url, error = %e, "cloudflare probe failed");
                if eval_errors >= CF_MAX_EVAL_ERRORS {
                    tracing::warn!(url, "cloudflare probe failed {eval_errors} times, assuming clear");
                    return Ok(());
                }
                tokio::time::sleep(CF_POLL_INTERVAL).await;
                continue;
            }
        };
        eval_errors = 0;

        if signals.is_interactive() {
            return Err(ReaderError::Source {
                message: "Cloudflare Turnstile detected, interaction required".to_string(),
                context: ErrorContext::default().with_url(url.to_string()),
                cause: None,
            });
        }
        if !signals.is_challenge() {
            if was_challenged {
                dbg.step(DebugStep::new(StepType::CfPassed, "challenge cleared").url(url));
                tracing::info!(url, "cloudflare challenge cleared");
            }
            return Ok(());
        }

        if !was_challenged {
            was_challenged = true;
            dbg.step(
                DebugStep::new(StepType::CfWait, format!("challenge detected: {}", signals.title))
                    .url(url),
            );
        }
        if Instant::now() + CF_POLL_INTERVAL >= wait_deadline {
            return Err(ReaderError::Source {
                message: "Cloudflare wait timed out".to_string(),
                context: ErrorContext::default().with_url(url.to_string()),
                cause: None,
            });
        }
        tokio::time::sleep(CF_POLL_INTERVAL).await;
    }
}

/// Dispose-on-drop wrapper so every exit path releases the controller.
struct ControllerGuard {
    controller: Box<dyn WebViewController>,
}

impl Drop for ControllerGuard {
    fn drop(&mut self) {
        self.controller.dispose();
    }
}

/// Load `url` in a fresh controller and run the extraction script against
/// the settled page. Network errors pass through untouched; anything else
/// surfaces as a source error.
pub async fn webview_extract(
    provider: &dyn WebViewProvider,
    limiter: &RateLimiter,
    source: &Source,
    url: &str,
    script: &str,
    timeout: Duration,
    dbg: &DebugScope,
) -> ReaderResult<serde_json::Value> {
    let host = host_of(url);
    let limit = source.rate_limit.as_deref().and_then(parse_rate_limit);
    let _permit = limiter.acquire(&host, limit).await;

    let guard = ControllerGuard {
        controller: provider.create().map_err(|e| ReaderError::Source {
            message: format!("failed to create webview: {e}"),
            context: ErrorContext::default().with_url(url.to_string()),
            cause: Some(e),
        })?,
    };
    let controller = guard.controller.as_ref();

    if let Some(ua) = source.headers.as_ref().and_then(|headers| {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("user-agent"))
            .map(|(_, value)| value.clone())
    }) {
        controller.set_custom_user_agent(&ua);
    }

    let deadline = Instant::now() + timeout;
    let ctx = || ErrorContext::default().with_url(url.to_string());
    let requests = {
        let collected: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let sink = collected.clone();
        controller.install_request_hook(Arc::new(move |sub_url| {
            if let Ok(mut seen) = sink.lock() {
                if seen.len() < 64 {
                    seen.push(sub_url.to_string());
                }
            }
            true
        }));
        collected
    };

    dbg.step(DebugStep::new(StepType::Request, format!("loadUrl {url}")).url(url));

    let load = async {
        let loaded = controller
            .load_url(url)
            .await
            .map_err(|e| ReaderError::Network {
                message: format!("WebView load failed: {e}"),
                status_code: None,
                context: ctx(),
            })?;
        let settled = controller
            .wait_for_load()
            .await
            .map_err(|e| ReaderError::Network {
                message: format!("WebView load failed: {e}"),
                status_code: None,
                context: ctx(),
            })?;
        if !loaded || !settled {
            return Err(ReaderError::Network {
                message: "WebView load failed".to_string(),
                status_code: None,
                context: ctx(),
            });
        }
        Ok(())
    };
    tokio::time::timeout_at(deadline, load)
        .await
        .map_err(|_| ReaderError::Network {
            message: format!("WebView load timed out after {timeout:?}"),
            status_code: None,
            context: ctx(),
        })??;

    cloudflare_wait(controller, deadline, url, dbg).await?;

    if dbg.enabled() {
        if let Ok(html) = controller.get_html().await {
            let sub_requests = requests.lock().map(|r| r.clone()).unwrap_or_default();
            dbg.step(
                DebugStep::new(StepType::Response, "page settled")
                    .url(url)
                    .data(serde_json::json!({
                        "htmlPreview": html.chars().take(500).collect::<String>(),
                        "subRequests": sub_requests,
                    })),
            );
        }
    }

    let value = tokio::time::timeout_at(deadline, controller.evaluate_javascript(script))
        .await
        .map_err(|_| ReaderError::Network {
            message: format!("extraction timed out after {timeout:?}"),
            status_code: None,
            context: ctx(),
        })?
        .map_err(|e| ReaderError::Source {
            message: format!("extraction script failed: {e}"),
            context: ctx(),
            cause: Some(e),
        })?;

    if let Some(message) = value.get("__error").and_then(|v| v.as_str()) {
        return Err(ReaderError::Source {
            message: message.to_string(),
            context: ctx(),
            cause: None,
        });
    }
    Ok(value)
}

/// Headless-Chrome controller, compiled with `--features webview`.
#[cfg(feature = "webview")]
pub mod chrome {
    use super::*;
    use headless_chrome::{Browser, LaunchOptions, Tab};

    pub struct HeadlessChromeProvider {
        browser: Browser,
    }

    impl HeadlessChromeProvider {
        pub fn new() -> anyhow::Result<Self> {
            let browser = Browser::new(LaunchOptions {
                headless: true,
                sandbox: false,
                enable_gpu: false,
                enable_logging: false,
                idle_browser_timeout: Duration::from_secs(60),
                ..Default::default()
            })?;
            Ok(Self { browser })
        }
    }

    impl WebViewProvider for HeadlessChromeProvider {
        fn create(&self) -> anyhow::Result<Box<dyn WebViewController>> {
            let tab = self.browser.new_tab()?;
            tab.set_default_timeout(Duration::from_secs(30));
            Ok(Box::new(ChromeController { tab }))
        }
    }

    pub struct ChromeController {
        tab: Arc<Tab>,
    }

    #[async_trait]
    impl WebViewController for ChromeController {
        async fn load_url(&self, url: &str) -> anyhow::Result<bool> {
            let tab = self.tab.clone();
            let url = url.to_string();
            tokio::task::spawn_blocking(move || tab.navigate_to(&url).map(|_| true)).await?
        }

        async fn wait_for_load(&self) -> anyhow::Result<bool> {
            let tab = self.tab.clone();
            tokio::task::spawn_blocking(move || tab.wait_until_navigated().map(|_| true)).await?
        }

        async fn evaluate_javascript(&self, script: &str) -> anyhow::Result<serde_json::Value> {
            let tab = self.tab.clone();
            // the engine hands over a function body with a top-level return
            let wrapped = format!("(function() {{ {script} }})()");
            tokio::task::spawn_blocking(move || {
                let result = tab.evaluate(&wrapped, true)?;
                Ok(result.value.unwrap_or(serde_json::Value::Null))
            })
            .await?
        }

        async fn get_html(&self) -> anyhow::Result<String> {
            let tab = self.tab.clone();
            tokio::task::spawn_blocking(move || tab.get_content().map_err(Into::into)).await?
        }

        fn set_custom_user_agent(&self, user_agent: &str) {
            let _ = self.tab.set_user_agent(user_agent, None, None);
        }

        fn dispose(&self) {
            let _ = self.tab.close(false);
        }
    }
}
