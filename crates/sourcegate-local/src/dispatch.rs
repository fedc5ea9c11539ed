//! Executes one tool call against the search, fetch and render collaborators.
//!
//! Every call produces a `ToolResult`; nothing here returns `Err`. Page tools run the
//! classifier and the verification policy, then record the outcome in the run's
//! `Provenance`.

use crate::cache::{FsCache, Namespace};
use crate::classify::{classify_page, ClassifierConfig};
use crate::config::Settings;
use crate::extract::{preview, truncate_chars};
use crate::policy::verify;
use crate::provenance::Provenance;
use crate::search::{format_results, DEFAULT_SEARCH_RESULTS, MAX_SEARCH_RESULTS};
use crate::urlnorm::{normalize_query, normalize_url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sourcegate_core::{
    FetchBackend, FetchRequest, Mode, PageClassification, PageSnapshot, RejectReason,
    RenderBackend, SearchProvider, SearchQuery, SearchResult, ToolCall, ToolResult, ToolSpec,
    Verification, VerifiedMeta,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const SEARCH_WEB: &str = "search_web";
pub const FETCH_URL: &str = "fetch_url";
pub const RENDER_URL: &str = "render_url";

/// Candidate links listed in a page tool result.
pub const CANDIDATE_LINKS_SHOWN: usize = 10;
const REJECTED_PREVIEW_CHARS: usize = 500;
const DEFAULT_RENDER_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToolArgError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("arguments are not valid JSON: {0}")]
    Malformed(String),
    #[error("arguments must be a JSON object")]
    NotAnObject,
    #[error("missing or empty `{0}`")]
    Missing(&'static str),
    #[error("`{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("not a fetchable http(s) url: {0}")]
    InvalidUrl(String),
}

/// A parsed, validated tool call.
///
/// Page tools carry the URL as requested, which is what gets retrieved, and its
/// normalized `key` used for the cache, provenance and the page budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRequest {
    SearchWeb { query: String, count: usize },
    FetchUrl { url: String, key: String },
    RenderUrl { url: String, key: String },
}

impl ToolRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ToolRequest::SearchWeb { .. } => SEARCH_WEB,
            ToolRequest::FetchUrl { .. } => FETCH_URL,
            ToolRequest::RenderUrl { .. } => RENDER_URL,
        }
    }

    /// Parse the engine's raw arguments. Nothing about their shape is trusted.
    pub fn parse(call: &ToolCall) -> Result<Self, ToolArgError> {
        let name = call.name.trim();
        if !matches!(name, SEARCH_WEB | FETCH_URL | RENDER_URL) {
            return Err(ToolArgError::UnknownTool(name.to_string()));
        }
        let raw = call.arguments.trim();
        let args: serde_json::Value = if raw.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(raw).map_err(|e| ToolArgError::Malformed(e.to_string()))?
        };
        let obj = args.as_object().ok_or(ToolArgError::NotAnObject)?;

        match name {
            SEARCH_WEB => {
                let query = required_str(obj, "query")?;
                let count = match obj.get("count") {
                    None | Some(serde_json::Value::Null) => DEFAULT_SEARCH_RESULTS,
                    Some(v) => count_value(v)?,
                };
                Ok(ToolRequest::SearchWeb {
                    query,
                    count: count.clamp(1, MAX_SEARCH_RESULTS),
                })
            }
            FETCH_URL => {
                let (url, key) = page_url(obj)?;
                Ok(ToolRequest::FetchUrl { url, key })
            }
            _ => {
                let (url, key) = page_url(obj)?;
                Ok(ToolRequest::RenderUrl { url, key })
            }
        }
    }
}

fn required_str(
    obj: &serde_json::Map<String, serde_json::Value>,
    field: &'static str,
) -> Result<String, ToolArgError> {
    match obj.get(field) {
        None | Some(serde_json::Value::Null) => Err(ToolArgError::Missing(field)),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
            Err(ToolArgError::Missing(field))
        }
        Some(serde_json::Value::String(s)) => Ok(s.trim().to_string()),
        Some(_) => Err(ToolArgError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn count_value(v: &serde_json::Value) -> Result<usize, ToolArgError> {
    let wrong = ToolArgError::WrongType {
        field: "count",
        expected: "a positive integer",
    };
    if let Some(n) = v.as_u64() {
        return Ok(n as usize);
    }
    if let Some(f) = v.as_f64() {
        return if f >= 1.0 { Ok(f as usize) } else { Err(wrong) };
    }
    v.as_str()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .ok_or(wrong)
}

/// The requested URL and its normalized key.
fn page_url(
    obj: &serde_json::Map<String, serde_json::Value>,
) -> Result<(String, String), ToolArgError> {
    let raw = required_str(obj, "url")?;
    match normalize_url(&raw) {
        Some(key) => Ok((raw, key)),
        None => Err(ToolArgError::InvalidUrl(raw)),
    }
}

/// Whether `mode` offers the named tool.
pub fn tool_offered(mode: Mode, tool: &str) -> bool {
    match mode {
        Mode::Auto => matches!(tool, SEARCH_WEB | FETCH_URL | RENDER_URL),
        Mode::Search => matches!(tool, SEARCH_WEB | FETCH_URL),
        Mode::Browser => matches!(tool, SEARCH_WEB | RENDER_URL),
    }
}

/// Tool specifications handed to the decision engine.
pub fn tool_specs(mode: Mode) -> Vec<ToolSpec> {
    let url_params = |what: &str| {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": format!("Absolute http(s) URL to {what}.")}
            },
            "required": ["url"]
        })
    };
    let all = [
        ToolSpec {
            name: SEARCH_WEB.to_string(),
            description: "Search the web. Returns titles, URLs and snippets. Search results are \
                          not verified; fetch a page before citing it."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search query."},
                    "count": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": MAX_SEARCH_RESULTS,
                        "description": "Number of results (default 5)."
                    }
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: FETCH_URL.to_string(),
            description: "Fetch a page over plain HTTP and verify it. Only verified pages may be \
                          cited."
                .to_string(),
            parameters: url_params("fetch"),
        },
        ToolSpec {
            name: RENDER_URL.to_string(),
            description: "Render a page in a headless browser (executes JavaScript) and verify \
                          it. Slower than fetch_url; use it for script-heavy pages."
                .to_string(),
            parameters: url_params("render"),
        },
    ];
    all.into_iter()
        .filter(|t| tool_offered(mode, &t.name))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub classifier: ClassifierConfig,
    pub max_page_text_chars: usize,
    pub fetch_timeout: Duration,
    /// Navigation timeout handed to the renderer.
    pub render_timeout: Duration,
    /// Added to `render_timeout` to get the wall clock a render may take in total.
    pub render_grace: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl DispatchConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            classifier: ClassifierConfig {
                listing_min_products: s.listing_min_products,
                ..ClassifierConfig::default()
            },
            max_page_text_chars: s.max_page_text_chars,
            fetch_timeout: s.fetch_timeout,
            render_timeout: s.render_timeout,
            render_grace: DEFAULT_RENDER_GRACE,
        }
    }

    fn render_wall_clock(&self) -> Duration {
        self.render_timeout + self.render_grace
    }
}

/// What the fetch and render namespaces store: the snapshot and its classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedPage {
    snapshot: PageSnapshot,
    classification: PageClassification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageTool {
    Fetch,
    Render,
}

impl PageTool {
    fn namespace(self) -> Namespace {
        match self {
            PageTool::Fetch => Namespace::Fetch,
            PageTool::Render => Namespace::Render,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            PageTool::Fetch => "fetch",
            PageTool::Render => "render",
        }
    }

    fn past(self) -> &'static str {
        match self {
            PageTool::Fetch => "Fetched",
            PageTool::Render => "Rendered",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PageTarget<'a> {
    url: &'a str,
    key: &'a str,
}

pub struct ToolDispatcher {
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn FetchBackend>,
    renderer: Arc<dyn RenderBackend>,
    cache: Option<FsCache>,
    cfg: DispatchConfig,
}

impl ToolDispatcher {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn FetchBackend>,
        renderer: Arc<dyn RenderBackend>,
        cache: Option<FsCache>,
        cfg: DispatchConfig,
    ) -> Self {
        Self {
            search,
            fetcher,
            renderer,
            cache,
            cfg,
        }
    }

    /// Run one tool call. `max_pages` bounds distinct page URLs per run.
    pub async fn execute(
        &self,
        call: &ToolCall,
        mode: Mode,
        provenance: &mut Provenance,
        max_pages: usize,
    ) -> ToolResult {
        let req = match ToolRequest::parse(call) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(tool = %call.name, id = %call.id, "bad tool call: {e}");
                return ToolResult::failure(format!("Error: {e}"));
            }
        };
        if !tool_offered(mode, req.name()) {
            return ToolResult::failure(format!(
                "Error: tool `{}` is not available in {} mode",
                req.name(),
                mode.as_str()
            ));
        }

        match req {
            ToolRequest::SearchWeb { query, count } => self.search_web(&query, count).await,
            ToolRequest::FetchUrl { url, key } => {
                let target = PageTarget { url: &url, key: &key };
                self.page(PageTool::Fetch, target, mode, provenance, max_pages)
                    .await
            }
            ToolRequest::RenderUrl { url, key } => {
                let target = PageTarget { url: &url, key: &key };
                self.page(PageTool::Render, target, mode, provenance, max_pages)
                    .await
            }
        }
    }

    async fn search_web(&self, query: &str, count: usize) -> ToolResult {
        let key = normalize_query(query);
        let cached: Option<Vec<SearchResult>> = self.cache_get(Namespace::Search, &key).await;
        let results = match cached {
            Some(rs) => {
                tracing::debug!(query = %key, "search cache hit");
                rs
            }
            None => {
                let q = SearchQuery {
                    query: query.to_string(),
                    // Fetch the full page once; smaller counts are served from the cache.
                    max_results: Some(MAX_SEARCH_RESULTS),
                    timeout_ms: None,
                };
                match self.search.search(&q).await {
                    Ok(resp) => {
                        self.cache_put(Namespace::Search, &key, resp.results.clone())
                            .await;
                        resp.results
                    }
                    Err(e) => {
                        tracing::warn!(provider = self.search.name(), query = %key, "search failed: {e}");
                        return ToolResult::failure(format!("Search failed: {e}"));
                    }
                }
            }
        };

        let results: Vec<SearchResult> = results.into_iter().take(count).collect();
        if results.is_empty() {
            return ToolResult::failure(
                "No search results found. Try a different query.".to_string(),
            );
        }
        ToolResult::ok(format_results(&results))
    }

    async fn page(
        &self,
        tool: PageTool,
        target: PageTarget<'_>,
        mode: Mode,
        provenance: &mut Provenance,
        max_pages: usize,
    ) -> ToolResult {
        let PageTarget { url, key } = target;
        if !provenance.is_attempted(key) && provenance.attempted_count() >= max_pages {
            tracing::warn!(url = %key, max_pages, "page budget exhausted");
            return ToolResult::failure(format!(
                "Error: page budget of {max_pages} exhausted. Answer with the verified pages you already have."
            ));
        }
        provenance.record_attempt(key);

        let ns = tool.namespace();
        let page = match self.cache_get::<CachedPage>(ns, key).await {
            Some(p) => {
                tracing::debug!(url = %key, namespace = %ns, "page cache hit");
                p
            }
            None => {
                let snapshot = match self.retrieve(tool, url).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(url = %url, tool = tool.verb(), "transport error: {e}");
                        provenance.record_rejected(key, RejectReason::TransportError);
                        let mut r = ToolResult::failure(transport_message(tool, url, mode, &e));
                        r.url = Some(url.to_string());
                        r.verification = Some(Verification::Rejected {
                            reason: RejectReason::TransportError,
                        });
                        return r;
                    }
                };
                let classification = classify_page(
                    &snapshot.html,
                    &snapshot.text,
                    &snapshot.final_url,
                    &self.cfg.classifier,
                );
                let page = CachedPage {
                    snapshot,
                    classification,
                };
                if !page.snapshot.html.trim().is_empty() {
                    self.cache_put(ns, key, page.clone()).await;
                }
                page
            }
        };

        self.judge(tool, url, key, page, provenance)
    }

    async fn retrieve(&self, tool: PageTool, url: &str) -> sourcegate_core::Result<PageSnapshot> {
        match tool {
            PageTool::Fetch => {
                let req = FetchRequest {
                    timeout_ms: Some(self.cfg.fetch_timeout.as_millis() as u64),
                    ..FetchRequest::new(url)
                };
                self.fetcher.fetch(&req).await
            }
            PageTool::Render => {
                let req = FetchRequest {
                    timeout_ms: Some(self.cfg.render_timeout.as_millis() as u64),
                    ..FetchRequest::new(url)
                };
                let wall = self.cfg.render_wall_clock();
                match tokio::time::timeout(wall, self.renderer.render(&req)).await {
                    Ok(r) => r,
                    Err(_) => Err(sourcegate_core::Error::Timeout(format!(
                        "render exceeded {}ms",
                        wall.as_millis()
                    ))),
                }
            }
        }
    }

    /// Apply the verification policy and update provenance.
    fn judge(
        &self,
        tool: PageTool,
        url: &str,
        key: &str,
        page: CachedPage,
        provenance: &mut Provenance,
    ) -> ToolResult {
        let CachedPage {
            snapshot,
            classification: c,
        } = page;
        let final_url = normalize_url(&snapshot.final_url).unwrap_or_else(|| key.to_string());
        let verification = verify(snapshot.status, &final_url, &c);
        tracing::info!(
            url = %url,
            final_url = %final_url,
            status = snapshot.status,
            verdict = %c.verdict,
            product_count = c.product_count,
            accepted = verification.is_accepted(),
            "page judged"
        );

        let title = snapshot
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        let mut result = match &verification {
            Verification::Accepted { reason } => {
                provenance.record_verified(
                    key,
                    VerifiedMeta {
                        url: final_url.clone(),
                        title: title.clone().unwrap_or_else(|| final_url.clone()),
                        verdict: c.verdict,
                        product_count: c.product_count,
                        reason: reason.clone(),
                    },
                );
                let moved = (final_url != key).then_some(final_url.as_str());
                ToolResult::ok(self.accepted_content(tool, url, moved, &title, &snapshot, &c))
            }
            Verification::Rejected { reason } => {
                provenance.record_rejected(key, *reason);
                ToolResult::failure(rejected_content(tool, url, *reason, &snapshot, &c))
            }
        };
        result.url = Some(final_url);
        result.title = title;
        result.verdict = Some(c.verdict);
        result.verification = Some(verification);
        result
    }

    fn accepted_content(
        &self,
        tool: PageTool,
        url: &str,
        final_url: Option<&str>,
        title: &Option<String>,
        snapshot: &PageSnapshot,
        c: &PageClassification,
    ) -> String {
        let mut out = format!(
            "{} {url} (verified: {}, {} products)\n",
            tool.past(),
            c.verdict,
            c.product_count
        );
        if let Some(final_url) = final_url {
            out.push_str(&format!("Final URL: {final_url}\n"));
        }
        if let Some(t) = title {
            out.push_str(&format!("Title: {t}\n"));
        }
        let (text, clipped) = truncate_chars(snapshot.text.trim(), self.cfg.max_page_text_chars);
        out.push('\n');
        out.push_str(&text);
        if clipped {
            out.push_str("\n[content truncated]");
        }

        let links = &c.product_candidate_links;
        if !links.is_empty() {
            out.push_str(&format!(
                "\n\nFound {} product candidate links:\n",
                links.len()
            ));
            for (i, link) in links.iter().take(CANDIDATE_LINKS_SHOWN).enumerate() {
                out.push_str(&format!("{}. {link}\n", i + 1));
            }
            if links.len() > CANDIDATE_LINKS_SHOWN {
                out.push_str(&format!(
                    "... and {} more\n",
                    links.len() - CANDIDATE_LINKS_SHOWN
                ));
            }
        }
        out
    }

    async fn cache_get<T>(&self, ns: Namespace, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let cache = self.cache.clone()?;
        let key = key.to_string();
        match tokio::task::spawn_blocking(move || cache.get::<T>(ns, &key)).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(namespace = %ns, "cache read task failed: {e}");
                None
            }
        }
    }

    async fn cache_put<T>(&self, ns: Namespace, key: &str, value: T)
    where
        T: Serialize + Send + 'static,
    {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let key = key.to_string();
        match tokio::task::spawn_blocking(move || cache.put(ns, &key, &value)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(namespace = %ns, "cache write failed: {e}"),
            Err(e) => tracing::warn!(namespace = %ns, "cache write task failed: {e}"),
        }
    }
}

fn transport_message(tool: PageTool, url: &str, mode: Mode, e: &sourcegate_core::Error) -> String {
    let mut msg = format!("Failed to {} {url}: {e}.", tool.verb());
    if tool == PageTool::Fetch && tool_offered(mode, RENDER_URL) {
        msg.push_str(" Try render_url if this is a JavaScript-heavy page.");
    }
    msg
}

fn rejected_content(
    tool: PageTool,
    url: &str,
    reason: RejectReason,
    snapshot: &PageSnapshot,
    c: &PageClassification,
) -> String {
    let mut out = format!(
        "{} {url} but the page was rejected ({reason}): {}.",
        tool.past(),
        c.reason
    );
    if let Some(err) = snapshot.error.as_deref() {
        out.push_str(&format!(" Error: {err}."));
    }
    out.push_str(" Do not cite this page.");
    let text = preview(snapshot.text.trim(), REJECTED_PREVIEW_CHARS);
    if !text.is_empty() {
        out.push_str("\n\nPage content:\n");
        out.push_str(&text);
    }
    out
}
