use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod conversation;

pub use conversation::{Conversation, Decision, Message, Role, ToolCall, ToolSpec};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("render failed: {0}")]
    Render(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("decision engine failed: {0}")]
    Decision(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Stable machine-readable code for error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidUrl(_) => "invalid_url",
            Error::Fetch(_) => "fetch_failed",
            Error::Render(_) => "render_failed",
            Error::Timeout(_) => "timeout",
            Error::Cache(_) => "cache_error",
            Error::Search(_) => "search_failed",
            Error::RateLimited(_) => "rate_limited",
            Error::Decision(_) => "decision_failed",
            Error::NotConfigured(_) => "not_configured",
            Error::NotSupported(_) => "not_supported",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub const DEFAULT_MAX_STEPS: usize = 10;
pub const MAX_STEPS_LIMIT: usize = 20;
pub const DEFAULT_MAX_PAGES_FETCHED: usize = 8;

/// Which tools a run offers to the decision engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// search + fetch + render
    #[default]
    Auto,
    /// search + fetch (no script execution)
    Search,
    /// search + render
    Browser,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Search => "search",
            Mode::Browser => "browser",
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Mode::Auto),
            "search" => Ok(Mode::Search),
            "browser" => Ok(Mode::Browser),
            other => Err(Error::NotSupported(format!(
                "unknown mode {other:?} (allowed: auto, search, browser)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub prompt: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_pages_fetched")]
    pub max_pages_fetched: usize,
    /// Include the per-step trace in the response.
    #[serde(default)]
    pub debug: bool,
}

fn default_max_steps() -> usize {
    DEFAULT_MAX_STEPS
}

fn default_max_pages_fetched() -> usize {
    DEFAULT_MAX_PAGES_FETCHED
}

impl RunRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: Mode::Auto,
            max_steps: DEFAULT_MAX_STEPS,
            max_pages_fetched: DEFAULT_MAX_PAGES_FETCHED,
            debug: false,
        }
    }

    /// `max_steps` clamped into `[1, MAX_STEPS_LIMIT]`.
    pub fn effective_max_steps(&self) -> usize {
        self.max_steps.clamp(1, MAX_STEPS_LIMIT)
    }

    /// Page budget; zero is treated as one so a run can always look at something.
    pub fn effective_max_pages(&self) -> usize {
        self.max_pages_fetched.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTrace {
    pub step: usize,
    pub tool: String,
    pub args: serde_json::Value,
    pub success: bool,
    pub result_chars: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<PageVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Verification>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    LimitReached,
    DecisionFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    pub status: RunStatus,
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<Vec<StepTrace>>,
}

/// Structural verdict for one fetched or rendered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageVerdict {
    Product,
    ListingWithProducts,
    ListingEmpty,
    Blocked,
    Generic,
    Error,
}

impl PageVerdict {
    pub const ALL: [PageVerdict; 6] = [
        PageVerdict::Product,
        PageVerdict::ListingWithProducts,
        PageVerdict::ListingEmpty,
        PageVerdict::Blocked,
        PageVerdict::Generic,
        PageVerdict::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PageVerdict::Product => "product",
            PageVerdict::ListingWithProducts => "listing_with_products",
            PageVerdict::ListingEmpty => "listing_empty",
            PageVerdict::Blocked => "blocked",
            PageVerdict::Generic => "generic",
            PageVerdict::Error => "error",
        }
    }

    /// The only verdicts a page may be trusted with.
    pub fn is_positive(self) -> bool {
        matches!(
            self,
            PageVerdict::Product | PageVerdict::ListingWithProducts
        )
    }
}

impl fmt::Display for PageVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw structural measurements behind a verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSignals {
    pub json_ld_products: usize,
    pub microdata_products: usize,
    pub product_links: usize,
    pub text_chars: usize,
    pub script_count: usize,
    pub script_chars: usize,
    pub challenge_elements: usize,
    pub meta_refresh: bool,
    pub listing_url: bool,
    pub generic_path: bool,
    pub product_url: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageClassification {
    pub verdict: PageVerdict,
    pub product_count: usize,
    pub reason: String,
    pub signals: PageSignals,
    /// Same-host product-shaped links found on listing pages.
    #[serde(default)]
    pub product_candidate_links: Vec<String>,
}

/// Why a page was refused. Serialized as its wire code (`http_error:403`, `blocked`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    HttpError(u16),
    Blocked,
    EmptyListing,
    GenericRedirect,
    TransportError,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::HttpError(code) => write!(f, "http_error:{code}"),
            RejectReason::Blocked => f.write_str("blocked"),
            RejectReason::EmptyListing => f.write_str("empty_listing"),
            RejectReason::GenericRedirect => f.write_str("generic_redirect"),
            RejectReason::TransportError => f.write_str("transport_error"),
        }
    }
}

impl FromStr for RejectReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blocked" => Ok(RejectReason::Blocked),
            "empty_listing" => Ok(RejectReason::EmptyListing),
            "generic_redirect" => Ok(RejectReason::GenericRedirect),
            "transport_error" => Ok(RejectReason::TransportError),
            other => other
                .strip_prefix("http_error:")
                .and_then(|code| code.parse::<u16>().ok())
                .map(RejectReason::HttpError)
                .ok_or_else(|| Error::NotSupported(format!("unknown reject reason {other:?}"))),
        }
    }
}

impl Serialize for RejectReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RejectReason {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Outcome of the verification policy for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Verification {
    Accepted { reason: String },
    Rejected { reason: RejectReason },
}

impl Verification {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verification::Accepted { .. })
    }

    pub fn reason(&self) -> String {
        match self {
            Verification::Accepted { reason } => reason.clone(),
            Verification::Rejected { reason } => reason.to_string(),
        }
    }
}

/// Metadata kept for a verified URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedMeta {
    pub url: String,
    pub title: String,
    pub verdict: PageVerdict,
    pub product_count: usize,
    pub reason: String,
}

/// Outcome of executing one tool call; always produced, never an `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text handed back to the decision engine.
    pub content: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<PageVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
}

impl ToolResult {
    pub fn failure(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: false,
            url: None,
            title: None,
            verdict: None,
            verification: None,
        }
    }

    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            ..Self::failure(content)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    /// Timeout for the operation (network + processing).
    pub timeout_ms: Option<u64>,
    /// Hard cap on bytes read from the response body.
    pub max_bytes: Option<u64>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: None,
            max_bytes: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// What a fetch or render produced. Non-2xx responses are still snapshots;
/// only transport failures become `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub html: String,
    pub title: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub timings_ms: BTreeMap<String, u128>,
}

#[async_trait::async_trait]
pub trait FetchBackend: Send + Sync {
    async fn fetch(&self, req: &FetchRequest) -> Result<PageSnapshot>;
}

/// Script-executing page retrieval.
#[async_trait::async_trait]
pub trait RenderBackend: Send + Sync {
    async fn render(&self, req: &FetchRequest) -> Result<PageSnapshot>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: Option<usize>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub provider: String,
    pub timings_ms: BTreeMap<String, u128>,
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse>;
}

/// The external reasoning service.
#[async_trait::async_trait]
pub trait DecisionEngine: Send + Sync {
    async fn decide(&self, conversation: &[Message], tools: &[ToolSpec]) -> Result<Decision>;
}
