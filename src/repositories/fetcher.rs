use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, redirect, Client, Proxy};
use url::Url;

use crate::settings;
use crate::utils::DomainAllowList;

const MAX_TIMEOUT_SECS: u64 = 15;
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid proxy {0}: {1}")]
    InvalidProxy(String, String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Remote error: HTTP {status}")]
    RemoteError { status: u16 },
}

impl FetchError {
    pub fn reason(&self) -> &'static str {
        match self {
            FetchError::InvalidProxy(..) | FetchError::Network(_) => "network",
            FetchError::RemoteError { .. } => "remote_error",
        }
    }
}

#[derive(Clone, Debug)]
pub struct FetchedBody {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub truncated: bool,
    pub final_url: Url,
}

impl FetchedBody {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map_or(false, |ct| ct.to_ascii_lowercase().contains("json"))
    }
}

/// Retrieves a receipt document. Callers allow-list the URL before calling.
#[async_trait]
pub trait ReceiptFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedBody, FetchError>;
}

struct Route {
    label: String,
    client: Client,
}

/// GETs receipts through the configured proxies in order, then directly.
/// TLS verification is always on; there is no switch to turn it off.
pub struct HttpFetcher {
    routes: Vec<Route>,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: &settings::Fetcher, allow_list: DomainAllowList) -> Result<Self, FetchError> {
        let mut routes = Vec::new();

        for proxy in &config.proxies {
            let proxy_conf = Proxy::all(proxy.as_str())
                .map_err(|e| FetchError::InvalidProxy(proxy.clone(), e.to_string()))?;
            let client = Self::build_client(config, &allow_list)
                .proxy(proxy_conf)
                .build()
                .map_err(|e| FetchError::InvalidProxy(proxy.clone(), e.to_string()))?;

            routes.push(Route {
                label: format!("proxy {}", proxy),
                client,
            });
        }

        if routes.is_empty() || config.direct_fallback {
            let client = Self::build_client(config, &allow_list)
                .no_proxy()
                .build()
                .map_err(|e| FetchError::Network(e.to_string()))?;

            routes.push(Route {
                label: "direct".to_string(),
                client,
            });
        }

        Ok(HttpFetcher {
            routes,
            max_body_bytes: config.max_body_bytes.max(1),
        })
    }

    fn build_client(config: &settings::Fetcher, allow_list: &DomainAllowList) -> reqwest::ClientBuilder {
        let max_redirects = config.max_redirects.min(MAX_REDIRECTS);
        let allow_list = allow_list.clone();

        // Every hop must stay on the allow-list, not just the submitted URL.
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                attempt.error("too many redirects")
            } else if !allow_list.permits(attempt.url()) {
                attempt.error("redirect to a host outside the allow-list")
            } else {
                attempt.follow()
            }
        });

        Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.clamp(1, MAX_TIMEOUT_SECS)))
            .connect_timeout(Duration::from_secs(5))
            .redirect(policy)
            .user_agent(config.user_agent.as_str())
    }

    async fn fetch_via(&self, route: &Route, url: &Url) -> Result<FetchedBody, FetchError> {
        let mut response = route
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(FetchError::RemoteError {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let final_url = response.url().clone();

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?
        {
            let remaining = self.max_body_bytes - body.len();
            if chunk.len() > remaining {
                body.extend_from_slice(&chunk[..remaining]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        if truncated {
            log::warn!(
                "Receipt body from {} truncated at {} bytes.",
                final_url.host_str().unwrap_or("?"),
                self.max_body_bytes
            );
        }

        Ok(FetchedBody {
            body,
            content_type,
            truncated,
            final_url,
        })
    }
}

#[async_trait]
impl ReceiptFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedBody, FetchError> {
        let mut last_error = None;

        for route in &self.routes {
            match self.fetch_via(route, url).await {
                Ok(fetched) => return Ok(fetched),
                Err(e) => {
                    log::warn!("Receipt fetch via {} failed: {}", route.label, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::Network("no fetch route configured".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn local_fetcher(max_body_bytes: usize, proxies: Vec<String>) -> HttpFetcher {
        let config = settings::Fetcher {
            max_body_bytes,
            proxies,
            ..Default::default()
        };

        HttpFetcher::new(&config, DomainAllowList::new(["127.0.0.1"])).unwrap()
    }

    fn url(server: &MockServer, p: &str) -> Url {
        Url::parse(&format!("{}{}", server.uri(), p)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/receipt/1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html>ok</html>", "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let fetched = local_fetcher(1024, vec![])
            .fetch(&url(&server, "/receipt/1"))
            .await
            .unwrap();

        assert_eq!(fetched.text(), "<html>ok</html>");
        assert_eq!(fetched.content_type.as_deref(), Some("text/html; charset=utf-8"));
        assert!(!fetched.truncated);
        assert!(!fetched.is_json());
    }

    #[tokio::test]
    async fn test_error_status_is_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = local_fetcher(1024, vec![])
            .fetch(&url(&server, "/missing"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::RemoteError { status: 404 }));
        assert_eq!(err.reason(), "remote_error");
    }

    #[tokio::test]
    async fn test_large_body_is_truncated_not_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
            .mount(&server)
            .await;

        let fetched = local_fetcher(1000, vec![])
            .fetch(&url(&server, "/big"))
            .await
            .unwrap();

        assert_eq!(fetched.body.len(), 1000);
        assert!(fetched.truncated);
    }

    #[tokio::test]
    async fn test_redirect_off_allow_list_is_refused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/start"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "http://attacker.example/steal"),
            )
            .mount(&server)
            .await;

        let err = local_fetcher(1024, vec![])
            .fetch(&url(&server, "/start"))
            .await
            .unwrap_err();

        assert_eq!(err.reason(), "network");
    }

    #[tokio::test]
    async fn test_redirect_loop_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
            .mount(&server)
            .await;

        let err = local_fetcher(1024, vec![])
            .fetch(&url(&server, "/loop"))
            .await
            .unwrap_err();

        assert_eq!(err.reason(), "network");
    }

    #[tokio::test]
    async fn test_dead_proxy_falls_back_to_direct() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("direct"))
            .mount(&server)
            .await;

        let fetcher = local_fetcher(1024, vec!["http://127.0.0.1:9".to_string()]);
        assert_eq!(fetcher.routes.len(), 2);

        let fetched = fetcher.fetch(&url(&server, "/r")).await.unwrap();
        assert_eq!(fetched.text(), "direct");
    }
}
