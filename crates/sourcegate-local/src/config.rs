//! Environment-driven settings (`SOURCEGATE_*`).

use crate::cache::CacheTtls;
use crate::classify::DEFAULT_LISTING_MIN_PRODUCTS;
use crate::search::RetryPolicy;
use sourcegate_core::DEFAULT_MAX_PAGES_FETCHED;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LLM_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_LLM_MODEL: &str = "google/gemini-2.0-flash";
pub const DEFAULT_MAX_PAGE_TEXT_CHARS: usize = 20_000;

/// Trimmed value; empty counts as unset.
pub fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// First set key wins.
pub fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| env(k))
}

pub fn env_flag(key: &str) -> bool {
    matches!(
        env(key).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env(key) {
        None => default,
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, default, "ignoring unparsable setting");
            default
        }),
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env_u64(key, default as u64) as usize
}

pub fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("sourcegate-cache")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub cache_dir: PathBuf,
    pub cache_enabled: bool,
    pub cache_ttls: CacheTtls,
    pub max_pages_fetched: usize,
    pub max_page_text_chars: usize,
    pub listing_min_products: usize,
    pub fetch_timeout: Duration,
    /// Navigation timeout handed to the renderer; the dispatcher adds a grace period on top.
    pub render_timeout: Duration,
    pub search_retry: RetryPolicy,
    pub llm: LlmSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            cache_enabled: true,
            cache_ttls: CacheTtls::default(),
            max_pages_fetched: DEFAULT_MAX_PAGES_FETCHED,
            max_page_text_chars: DEFAULT_MAX_PAGE_TEXT_CHARS,
            listing_min_products: DEFAULT_LISTING_MIN_PRODUCTS,
            fetch_timeout: Duration::from_millis(30_000),
            render_timeout: Duration::from_millis(30_000),
            search_retry: RetryPolicy::default(),
            llm: LlmSettings {
                base_url: DEFAULT_LLM_BASE_URL.to_string(),
                api_key: None,
                model: DEFAULT_LLM_MODEL.to_string(),
            },
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = |key: &str, default: Duration| Duration::from_secs(env_u64(key, default.as_secs()));
        let millis =
            |key: &str, default: Duration| Duration::from_millis(env_u64(key, default.as_millis() as u64));

        Self {
            cache_dir: env("SOURCEGATE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.cache_dir),
            cache_enabled: !matches!(
                env("SOURCEGATE_CACHE")
                    .unwrap_or_default()
                    .to_ascii_lowercase()
                    .as_str(),
                "off" | "0" | "false" | "no"
            ),
            cache_ttls: CacheTtls {
                search: secs("SOURCEGATE_SEARCH_TTL_S", d.cache_ttls.search),
                fetch: secs("SOURCEGATE_FETCH_TTL_S", d.cache_ttls.fetch),
                render: secs("SOURCEGATE_RENDER_TTL_S", d.cache_ttls.render),
            },
            max_pages_fetched: env_usize("SOURCEGATE_MAX_PAGES_FETCHED", d.max_pages_fetched).max(1),
            max_page_text_chars: env_usize("SOURCEGATE_MAX_PAGE_TEXT_CHARS", d.max_page_text_chars),
            listing_min_products: env_usize("SOURCEGATE_LISTING_MIN_PRODUCTS", d.listing_min_products)
                .max(1),
            fetch_timeout: millis("SOURCEGATE_FETCH_TIMEOUT_MS", d.fetch_timeout),
            render_timeout: millis("SOURCEGATE_RENDER_TIMEOUT_MS", d.render_timeout),
            search_retry: RetryPolicy {
                max_attempts: env_u64(
                    "SOURCEGATE_SEARCH_MAX_ATTEMPTS",
                    d.search_retry.max_attempts as u64,
                )
                .clamp(1, 10) as u32,
                base_delay: millis("SOURCEGATE_SEARCH_BASE_DELAY_MS", d.search_retry.base_delay),
            },
            llm: LlmSettings {
                base_url: env("SOURCEGATE_LLM_BASE_URL").unwrap_or(d.llm.base_url),
                api_key: env_first(&["SOURCEGATE_LLM_API_KEY", "OPENROUTER_API_KEY"]),
                model: env_first(&["SOURCEGATE_LLM_MODEL", "OR_MODEL"]).unwrap_or(d.llm.model),
            },
        }
    }
}
