use sourcegate_core::{Error, FetchBackend, FetchRequest, PageSnapshot, Result};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod agent;
pub mod cache;
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod extract;
pub mod links;
pub mod openai_compat;
pub mod policy;
pub mod provenance;
pub mod render_playwright;
pub mod sanitize;
pub mod search;
pub mod urlnorm;

pub use agent::AgentLoop;
pub use cache::{FsCache, Namespace};
pub use classify::{classify_page, ClassifierConfig};
pub use dispatch::ToolDispatcher;
pub use provenance::Provenance;
pub use sanitize::{sanitize_answer, REMOVED_URL_MARKER};

const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;

fn is_textual_content_type(ct: Option<&str>) -> bool {
    let Some(ct) = ct else {
        return true;
    };
    let ct = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    ct.is_empty()
        || ct.starts_with("text/")
        || ct.contains("html")
        || ct.contains("xml")
        || ct == "application/json"
        || ct == "application/ld+json"
}

/// Plain HTTP page retrieval. Non-2xx responses come back as snapshots with their status;
/// only transport failures are errors.
#[derive(Debug, Clone)]
pub struct LocalFetcher {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl LocalFetcher {
    pub fn new(default_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sourcegate/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .timeout(default_timeout)
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            default_timeout,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Fetch(e.to_string())
    }
}

#[async_trait::async_trait]
impl FetchBackend for LocalFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<PageSnapshot> {
        let t0 = std::time::Instant::now();
        let url = url::Url::parse(&req.url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(format!("unsupported scheme: {}", url.scheme())));
        }

        let resp = self
            .client
            .get(url)
            .timeout(req.timeout().unwrap_or(self.default_timeout))
            .send()
            .await
            .map_err(transport_error)?;
        let final_url = resp.url().to_string();
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let max_bytes = req.max_bytes.unwrap_or(DEFAULT_MAX_BYTES) as usize;
        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport_error)?;
            if bytes.len().saturating_add(chunk.len()) > max_bytes {
                let can_take = max_bytes.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        let mut timings_ms = BTreeMap::new();
        timings_ms.insert("network_fetch".to_string(), t0.elapsed().as_millis());

        if !is_textual_content_type(content_type.as_deref()) {
            return Ok(PageSnapshot {
                url: req.url.clone(),
                final_url,
                status,
                html: String::new(),
                title: None,
                text: String::new(),
                error: Some(format!(
                    "unsupported content type: {}",
                    content_type.unwrap_or_default()
                )),
                timings_ms,
            });
        }

        let html = String::from_utf8_lossy(&bytes).into_owned();
        Ok(PageSnapshot {
            url: req.url.clone(),
            final_url,
            status,
            title: extract::html_title(&html),
            text: extract::html_to_text(&html, 120),
            html,
            error: None,
            timings_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{header, StatusCode},
        response::Redirect,
        routing::get,
        Router,
    };
    use std::net::SocketAddr;

    async fn serve() -> SocketAddr {
        let app = Router::new()
            .route(
                "/page",
                get(|| async {
                    (
                        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                        "<html><head><title>Widget</title></head><body><p>Hello page</p></body></html>",
                    )
                }),
            )
            .route(
                "/forbidden",
                get(|| async {
                    (
                        StatusCode::FORBIDDEN,
                        [(header::CONTENT_TYPE, "text/html")],
                        "<p>nope</p>",
                    )
                }),
            )
            .route("/moved", get(|| async { Redirect::temporary("/page") }))
            .route(
                "/big",
                get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "x".repeat(10_000)) }),
            )
            .route(
                "/pdf",
                get(|| async { ([(header::CONTENT_TYPE, "application/pdf")], "%PDF-1.7") }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    "late"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn fetcher() -> LocalFetcher {
        LocalFetcher::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn fetches_title_and_text() {
        let addr = serve().await;
        let s = fetcher()
            .fetch(&FetchRequest::new(format!("http://{addr}/page")))
            .await
            .unwrap();
        assert_eq!(s.status, 200);
        assert_eq!(s.title.as_deref(), Some("Widget"));
        assert!(s.text.contains("Hello page"));
        assert!(s.error.is_none());
    }

    #[tokio::test]
    async fn non_2xx_is_a_snapshot_not_an_error() {
        let addr = serve().await;
        let s = fetcher()
            .fetch(&FetchRequest::new(format!("http://{addr}/forbidden")))
            .await
            .unwrap();
        assert_eq!(s.status, 403);
        assert!(s.html.contains("nope"));
    }

    #[tokio::test]
    async fn follows_redirects_and_reports_final_url() {
        let addr = serve().await;
        let s = fetcher()
            .fetch(&FetchRequest::new(format!("http://{addr}/moved")))
            .await
            .unwrap();
        assert_eq!(s.url, format!("http://{addr}/moved"));
        assert_eq!(s.final_url, format!("http://{addr}/page"));
    }

    #[tokio::test]
    async fn body_is_capped_at_max_bytes() {
        let addr = serve().await;
        let req = FetchRequest {
            url: format!("http://{addr}/big"),
            timeout_ms: Some(2_000),
            max_bytes: Some(100),
        };
        let s = fetcher().fetch(&req).await.unwrap();
        assert_eq!(s.html.len(), 100);
    }

    #[tokio::test]
    async fn binary_content_has_no_markup() {
        let addr = serve().await;
        let s = fetcher()
            .fetch(&FetchRequest::new(format!("http://{addr}/pdf")))
            .await
            .unwrap();
        assert!(s.html.is_empty());
        assert!(s.error.as_deref().unwrap_or("").contains("application/pdf"));
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let addr = serve().await;
        let req = FetchRequest {
            url: format!("http://{addr}/slow"),
            timeout_ms: Some(200),
            max_bytes: None,
        };
        let err = fetcher().fetch(&req).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err:?}");
    }

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let err = fetcher()
            .fetch(&FetchRequest::new("file:///etc/passwd"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }
}
