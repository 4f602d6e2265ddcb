//! HTTP page navigator
//!
//! `PageNavigator` over plain HTTP with rate limiting. List pages come from
//! a URL template, detail references are resolved against the base URL.
//! Repeated connection failures escalate to `Unreachable`.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, direct::NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::crawling::errors::NavError;
use crate::crawling::navigator::{PageContent, PageNavigator};
use crate::domain::{Locator, Region};
use crate::infrastructure::config::SourceConfig;

pub struct HttpNavigator {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    base_url: Url,
    list_url_template: String,
    catalog_url: Option<Url>,
    static_regions: Vec<Region>,
    loading_markers: Vec<String>,
    unreachable_after: u32,
    connect_failures: AtomicU32,
}

impl HttpNavigator {
    pub fn new(source: &SourceConfig, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&source.user_agent).context("Invalid user agent")?,
        );
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create HTTP client")?;

        let quota = Quota::per_second(
            NonZeroU32::new(source.requests_per_second).context("Rate limit must be greater than 0")?,
        );
        let base_url = Url::parse(&source.base_url)
            .with_context(|| format!("Invalid base URL: {}", source.base_url))?;
        let catalog_url = source
            .catalog_url
            .as_deref()
            .map(|u| base_url.join(u))
            .transpose()
            .context("Invalid catalog URL")?;

        Ok(Self {
            client,
            rate_limiter: RateLimiter::direct(quota),
            base_url,
            list_url_template: source.list_url_template.clone(),
            catalog_url,
            static_regions: source.regions.clone(),
            loading_markers: source.loading_markers.clone(),
            unreachable_after: source.unreachable_after.max(1),
            connect_failures: AtomicU32::new(0),
        })
    }

    /// Absolute URL for a locator.
    pub fn url_for(&self, locator: &Locator) -> Option<Url> {
        match locator {
            Locator::ListPage {
                region_id,
                subregion_id,
                page,
            } => {
                let url = self
                    .list_url_template
                    .replace("{region_id}", region_id)
                    .replace("{subregion_id}", subregion_id)
                    .replace("{page_number}", &(u64::from(*page) + 1).to_string())
                    .replace("{page}", &page.to_string());
                self.base_url.join(&url).ok()
            }
            Locator::Detail(reference) => self.base_url.join(reference.trim()).ok(),
        }
    }

    fn is_loading(&self, body: &str) -> bool {
        body.trim().is_empty() || self.loading_markers.iter().any(|m| body.contains(m.as_str()))
    }

    fn classify(&self, locator: &Locator, timeout: Duration, error: &reqwest::Error) -> NavError {
        if error.is_timeout() {
            return NavError::Timeout {
                locator: locator.clone(),
                after: timeout,
            };
        }
        if error.is_connect() {
            let failures = self.connect_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= self.unreachable_after {
                return NavError::Unreachable(format!(
                    "{failures} consecutive connection failures, last: {error}"
                ));
            }
        }
        NavError::Transport {
            locator: locator.clone(),
            reason: error.to_string(),
        }
    }

    fn status_error(locator: &Locator, status: StatusCode) -> Option<NavError> {
        match status {
            s if s.is_success() => None,
            StatusCode::NOT_FOUND | StatusCode::GONE => Some(NavError::NotFound(locator.clone())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                Some(NavError::Blocked {
                    locator: locator.clone(),
                    reason: status.to_string(),
                })
            }
            s => Some(NavError::Transport {
                locator: locator.clone(),
                reason: format!("HTTP {s}"),
            }),
        }
    }
}

#[async_trait]
impl PageNavigator for HttpNavigator {
    async fn fetch(&self, locator: &Locator, timeout: Duration) -> Result<PageContent, NavError> {
        let Some(url) = self.url_for(locator) else {
            warn!(locator = %locator, "Locator does not form a valid URL");
            return Err(NavError::NotFound(locator.clone()));
        };
        self.rate_limiter.until_ready().await;
        debug!(url = %url, "Fetching");

        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.classify(locator, timeout, &e))?;
        self.connect_failures.store(0, Ordering::SeqCst);

        if let Some(error) = Self::status_error(locator, response.status()) {
            return Err(error);
        }
        let body = response
            .text()
            .await
            .map_err(|e| self.classify(locator, timeout, &e))?;

        if self.is_loading(&body) {
            debug!(url = %url, "Page still loading");
            return Ok(PageContent::loading(locator.clone()));
        }
        debug!(url = %url, chars = body.len(), "Fetched");
        Ok(PageContent::complete(locator.clone(), body))
    }

    async fn discover_regions(&self, timeout: Duration) -> Result<Vec<Region>, NavError> {
        let Some(catalog) = &self.catalog_url else {
            if self.static_regions.is_empty() {
                warn!("No catalog URL and no static regions configured");
            }
            return Ok(self.static_regions.clone());
        };
        let locator = Locator::detail(catalog.as_str());
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .get(catalog.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    NavError::Unreachable(format!("region catalog {catalog}: {e}"))
                } else {
                    self.classify(&locator, timeout, &e)
                }
            })?;
        if let Some(error) = Self::status_error(&locator, response.status()) {
            return Err(error);
        }
        response.json::<Vec<Region>>().await.map_err(|e| NavError::Transport {
            locator,
            reason: format!("unreadable region catalog: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// Answers one connection per canned response, in order.
    async fn serve(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                socket.write_all(response.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/")
    }

    fn source(base: &str) -> SourceConfig {
        SourceConfig {
            base_url: base.to_string(),
            list_url_template: "list/{region_id}/{subregion_id}?page={page_number}&offset={page}".into(),
            requests_per_second: 100,
            ..SourceConfig::default()
        }
    }

    fn navigator(source: &SourceConfig) -> HttpNavigator {
        HttpNavigator::new(source, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_list_url_from_template() {
        let nav = navigator(&source("https://portal.test/app/"));
        let url = nav
            .url_for(&Locator::ListPage {
                region_id: "n".into(),
                subregion_id: "n1".into(),
                page: 2,
            })
            .unwrap();
        assert_eq!(url.as_str(), "https://portal.test/app/list/n/n1?page=3&offset=2");
    }

    #[test]
    fn test_detail_reference_resolution() {
        let nav = navigator(&source("https://portal.test/app/"));
        let relative = nav.url_for(&Locator::detail("detail/42")).unwrap();
        assert_eq!(relative.as_str(), "https://portal.test/app/detail/42");
        let absolute = nav.url_for(&Locator::detail("https://other.test/d/7")).unwrap();
        assert_eq!(absolute.as_str(), "https://other.test/d/7");
    }

    #[tokio::test]
    async fn test_fetch_complete_and_loading_pages() {
        let base = serve(vec![
            http_response("200 OK", "<ul><li class=\"record\">A</li></ul>"),
            http_response("200 OK", "<div>Loading...</div>"),
        ])
        .await;
        let nav = navigator(&source(&base));
        let locator = Locator::detail("detail/1");

        let page = nav.fetch(&locator, Duration::from_secs(5)).await.unwrap();
        assert!(!page.is_loading());
        assert!(page.body.contains("record"));

        let page = nav.fetch(&locator, Duration::from_secs(5)).await.unwrap();
        assert!(page.is_loading());
    }

    #[tokio::test]
    async fn test_status_codes_mapped() {
        let base = serve(vec![
            http_response("404 Not Found", ""),
            http_response("429 Too Many Requests", ""),
            http_response("503 Service Unavailable", ""),
        ])
        .await;
        let nav = navigator(&source(&base));
        let locator = Locator::detail("detail/1");
        let timeout = Duration::from_secs(5);

        assert!(matches!(nav.fetch(&locator, timeout).await, Err(NavError::NotFound(_))));
        assert!(matches!(nav.fetch(&locator, timeout).await, Err(NavError::Blocked { .. })));
        assert!(matches!(nav.fetch(&locator, timeout).await, Err(NavError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_repeated_connect_failures_become_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let mut config = source(&base);
        config.unreachable_after = 2;
        let nav = navigator(&config);
        let locator = Locator::detail("detail/1");
        let timeout = Duration::from_secs(5);

        assert!(matches!(nav.fetch(&locator, timeout).await, Err(NavError::Transport { .. })));
        assert!(matches!(nav.fetch(&locator, timeout).await, Err(NavError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_catalog_discovery() {
        let catalog = r#"[{"id":"n","name":"North","subregions":[{"id":"n1","name":"North One"}]}]"#;
        let base = serve(vec![http_response("200 OK", catalog)]).await;
        let mut config = source(&base);
        config.catalog_url = Some("regions.json".into());
        let regions = navigator(&config).discover_regions(Duration::from_secs(5)).await;
        let regions = tokio_test::assert_ok!(regions);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].subregions[0].id, "n1");
    }

    #[tokio::test]
    async fn test_static_regions_without_catalog() {
        let mut config = source("https://portal.test/");
        config.regions = vec![Region::new("s", "South")];
        let regions = navigator(&config).discover_regions(Duration::from_secs(1)).await.unwrap();
        assert_eq!(regions[0].name, "South");
    }
}
