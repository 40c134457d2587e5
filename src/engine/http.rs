//! Fetch Backend - plain HTTP requests for `action: fetch` modules
//!
//! The client itself sits behind a trait so tests and embedders can swap
//! the network stack; `ReqwestClient` is the default implementation. The
//! backend entry point `fetch_text` handles rate limiting, timeouts,
//! charset decoding and debug tracing around one page load.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::time::Duration;

use super::debug::{DebugScope, DebugStep, StepType};
use super::rate_limit::{parse_rate_limit, RateLimiter};
use super::utils::host_of;
use crate::error::{ErrorContext, ReaderError, ReaderResult};
use crate::models::{HttpMethod, Source};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(15_000);

const BODY_PREVIEW_LEN: usize = 500;

/// A fully rendered request: URL and body templates already interpolated,
/// headers merged (request over source).
#[derive(Debug, Clone)]
pub struct RenderedRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
    pub charset: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub ok: bool,
    /// Final URL after redirects
    pub url: String,
    pub text: String,
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn fetch(&self, url: &str, request: &RenderedRequest) -> anyhow::Result<HttpResponse>;
}

/// Default client on reqwest, configured the way a reading backend needs:
/// cookies on, compressed transfer, a desktop UA.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn fetch(&self, url: &str, request: &RenderedRequest) -> anyhow::Result<HttpResponse> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
        };

        let mut headers = HeaderMap::new();
        for (key, value) in &request.headers {
            if let (Ok(name), Ok(val)) = (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, val);
            }
        }
        builder = builder.headers(headers).timeout(request.timeout);

        if request.method == HttpMethod::Post {
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let ok = response.status().is_success();
        let final_url = response.url().to_string();
        let text = match &request.charset {
            Some(charset) => decode_with_charset(&response.bytes().await?, charset),
            None => response.text().await?,
        };

        Ok(HttpResponse {
            status,
            ok,
            url: final_url,
            text,
        })
    }
}

/// One fetched page: the final URL (relative links resolve against it) and
/// the decoded body.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub text: String,
}

/// Load one page over plain HTTP: acquire the host's rate slot, run the
/// request under its deadline, decode, trace. Non-2xx raises a network
/// error carrying the status; the body preview goes to the debug log only.
pub async fn fetch_text(
    client: &dyn HttpClient,
    limiter: &RateLimiter,
    source: &Source,
    request: &RenderedRequest,
    dbg: &DebugScope,
) -> ReaderResult<FetchedPage> {
    let host = host_of(&request.url);
    let limit = source.rate_limit.as_deref().and_then(parse_rate_limit);
    let _permit = limiter.acquire(&host, limit).await;

    dbg.step(
        DebugStep::new(StepType::Request, format!("{:?} {}", request.method, request.url))
            .url(request.url.clone()),
    );
    tracing::debug!(source_id = %source.id, url = %request.url, method = ?request.method, "fetch");

    let context = || ErrorContext::default().with_url(request.url.clone());

    let response = tokio::time::timeout(request.timeout, client.fetch(&request.url, request))
        .await
        .map_err(|_| {
            ReaderError::Network {
                message: format!("request timed out after {:?}", request.timeout),
                status_code: None,
                context: context(),
            }
        })?
        .map_err(|e| ReaderError::Network {
            message: e.to_string(),
            status_code: None,
            context: context(),
        })?;

    if !response.ok {
        dbg.step(
            DebugStep::new(StepType::Response, format!("HTTP {}", response.status))
                .url(response.url.clone())
                .data(serde_json::json!({ "preview": preview(&response.text) })),
        );
        return Err(ReaderError::Network {
            message: format!("HTTP {}", response.status),
            status_code: Some(response.status),
            context: context(),
        });
    }

    dbg.step(
        DebugStep::new(StepType::Response, format!("HTTP {}", response.status))
            .url(response.url.clone())
            .data(serde_json::json!({
                "bytes": response.text.len(),
                "preview": preview(&response.text),
            })),
    );

    Ok(FetchedPage {
        url: response.url,
        text: response.text,
    })
}

fn preview(text: &str) -> String {
    let mut end = BODY_PREVIEW_LEN.min(text.len());
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    text[..end].to_string()
}

/// Decode response bytes with an explicit charset hint. Unknown charsets
/// fall back to lossy UTF-8.
pub fn decode_with_charset(bytes: &[u8], charset: &str) -> String {
    use encoding_rs::{GB18030, GBK, UTF_8};

    match charset.to_lowercase().as_str() {
        "gbk" | "gb2312" => {
            let (result, _, _) = GBK.decode(bytes);
            result.into_owned()
        }
        "gb18030" => {
            let (result, _, _) = GB18030.decode(bytes);
            result.into_owned()
        }
        "utf-8" | "utf8" | "" => {
            let (result, _, _) = UTF_8.decode(bytes);
            result.into_owned()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[cfg(test)]
pub mod testing {
    //! Canned HTTP client for executor tests.

    use super::*;
    use std::sync::Mutex;

    pub struct MockHttpClient {
        responses: Mutex<HashMap<String, HttpResponse>>,
        pub requests: Mutex<Vec<String>>,
    }

    impl MockHttpClient {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn respond(self, url: &str, body: &str) -> Self {
            self.responses.lock().unwrap().insert(
                url.to_string(),
                HttpResponse {
                    status: 200,
                    ok: true,
                    url: url.to_string(),
                    text: body.to_string(),
                },
            );
            self
        }

        pub fn respond_status(self, url: &str, status: u16, body: &str) -> Self {
            self.responses.lock().unwrap().insert(
                url.to_string(),
                HttpResponse {
                    status,
                    ok: (200..300).contains(&status),
                    url: url.to_string(),
                    text: body.to_string(),
                },
            );
            self
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn fetch(
            &self,
            url: &str,
            _request: &RenderedRequest,
        ) -> anyhow::Result<HttpResponse> {
            self.requests.lock().unwrap().push(url.to_string());
            self.responses
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no canned response for {url}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockHttpClient;
    use super::*;

    fn test_source() -> Source {
        serde_json::from_value(serde_json::json!({
            "id": "s1",
            "name": "Test",
            "host": "https://x"
        }))
        .unwrap()
    }

    fn request(url: &str) -> RenderedRequest {
        RenderedRequest {
            url: url.to_string(),
            method: HttpMethod::Get,
            headers: HashMap::new(),
            body: None,
            timeout: DEFAULT_TIMEOUT,
            charset: None,
        }
    }

    #[test]
    fn test_decode_gbk() {
        // "中文" in GBK
        let bytes = [0xD6, 0xD0, 0xCE, 0xC4];
        assert_eq!(decode_with_charset(&bytes, "gbk"), "中文");
        assert_eq!(decode_with_charset(b"plain", "utf-8"), "plain");
    }

    #[tokio::test]
    async fn test_fetch_text_ok() {
        let client = MockHttpClient::new().respond("https://x/page", "hello");
        let limiter = RateLimiter::new();
        let source = test_source();
        let page = fetch_text(
            &client,
            &limiter,
            &source,
            &request("https://x/page"),
            &DebugScope::disabled(),
        )
        .await
        .unwrap();
        assert_eq!(page.text, "hello");
        assert_eq!(page.url, "https://x/page");
    }

    #[tokio::test]
    async fn test_fetch_text_non_2xx() {
        let client = MockHttpClient::new().respond_status("https://x/miss", 404, "gone");
        let limiter = RateLimiter::new();
        let source = test_source();
        let err = fetch_text(
            &client,
            &limiter,
            &source,
            &request("https://x/miss"),
            &DebugScope::disabled(),
        )
        .await
        .unwrap_err();
        match err {
            ReaderError::Network {
                status_code,
                context,
                ..
            } => {
                assert_eq!(status_code, Some(404));
                assert_eq!(context.url.as_deref(), Some("https://x/miss"));
            }
            other => panic!("expected network error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_text_connection_error() {
        let client = MockHttpClient::new();
        let limiter = RateLimiter::new();
        let source = test_source();
        let err = fetch_text(
            &client,
            &limiter,
            &source,
            &request("https://x/nothing"),
            &DebugScope::disabled(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "network");
    }
}
