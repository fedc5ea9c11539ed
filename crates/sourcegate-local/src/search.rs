use crate::config::env_first;
use serde::Deserialize;
use sourcegate_core::{Error, Result, SearchProvider, SearchQuery, SearchResponse, SearchResult};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const MAX_SEARCH_RESULTS: usize = 10;
pub const DEFAULT_SEARCH_RESULTS: usize = 5;

const BRAVE_DEFAULT_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";

fn timeout_ms_from_query(q: &SearchQuery) -> u64 {
    q.timeout_ms.unwrap_or(20_000).clamp(1_000, 60_000)
}

fn brave_api_key_from_env() -> Option<String> {
    env_first(&[
        "SOURCEGATE_BRAVE_API_KEY",
        "BRAVE_API_KEY",
        "BRAVE_SEARCH_API_KEY",
    ])
}

fn brave_endpoint_from_env() -> Option<String> {
    env_first(&["SOURCEGATE_BRAVE_ENDPOINT"])
}

pub fn brave_configured() -> bool {
    brave_api_key_from_env().is_some()
}

#[derive(Debug, Clone)]
pub struct BraveSearchProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl BraveSearchProvider {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            endpoint: endpoint.unwrap_or_else(|| BRAVE_DEFAULT_ENDPOINT.to_string()),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = brave_api_key_from_env().ok_or_else(|| {
            Error::NotConfigured(
                "missing SOURCEGATE_BRAVE_API_KEY (or BRAVE_API_KEY / BRAVE_SEARCH_API_KEY)"
                    .to_string(),
            )
        })?;
        Ok(Self::new(client, api_key, brave_endpoint_from_env()))
    }
}

#[derive(Debug, Deserialize)]
struct BraveWebSearchResponse {
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    results: Option<Vec<BraveWebResult>>,
}

#[derive(Debug, Deserialize)]
struct BraveWebResult {
    url: String,
    title: Option<String>,
    description: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for BraveSearchProvider {
    fn name(&self) -> &'static str {
        "brave"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let count = q
            .max_results
            .unwrap_or(DEFAULT_SEARCH_RESULTS)
            .clamp(1, MAX_SEARCH_RESULTS);

        let count_s = count.to_string();

        let resp = self
            .client
            .get(&self.endpoint)
            .header("X-Subscription-Token", &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[("q", q.query.as_str()), ("count", count_s.as_str())])
            .timeout(Duration::from_millis(timeout_ms_from_query(q)))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited("brave search HTTP 429".to_string()));
        }
        if !status.is_success() {
            return Err(Error::Search(format!("brave search HTTP {status}")));
        }

        let parsed: BraveWebSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let results = parsed
            .web
            .and_then(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .take(count)
            .map(|r| SearchResult {
                url: r.url,
                title: r.title,
                snippet: r.description,
                source: "brave".to_string(),
            })
            .collect();

        let mut timings_ms = BTreeMap::new();
        timings_ms.insert("search".to_string(), t0.elapsed().as_millis());
        Ok(SearchResponse {
            results,
            provider: "brave".to_string(),
            timings_ms,
        })
    }
}

/// Stands in when no search API key is set; every search reports `NotConfigured`.
#[derive(Debug, Clone)]
pub struct UnconfiguredSearch {
    reason: String,
}

impl UnconfiguredSearch {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait::async_trait]
impl SearchProvider for UnconfiguredSearch {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    async fn search(&self, _q: &SearchQuery) -> Result<SearchResponse> {
        Err(Error::NotConfigured(self.reason.clone()))
    }
}

/// Exponential backoff for rate-limited searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Wraps a provider and retries `Error::RateLimited` per the policy; other errors pass through.
pub struct RetryingSearch<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: SearchProvider> RetryingSearch<P> {
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait::async_trait]
impl<P: SearchProvider> SearchProvider for RetryingSearch<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match self.inner.search(q).await {
                Err(Error::RateLimited(msg)) if attempt + 1 < attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        provider = self.inner.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "search rate limited; backing off: {msg}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Text handed to the decision engine for a search result list.
pub fn format_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No search results found.".to_string();
    }
    let mut out = format!("Found {} search results:\n", results.len());
    for r in results {
        out.push_str(&format!(
            "\n- {}\n  URL: {}\n",
            r.title.as_deref().unwrap_or("(untitled)"),
            r.url
        ));
        if let Some(s) = r.snippet.as_deref().filter(|s| !s.trim().is_empty()) {
            out.push_str(&format!("  {}\n", s.trim()));
        }
    }
    out
}
