//! Structural page classification.
//!
//! Only markup shape, URL shape and sizes are inspected; no phrase matching on page
//! text, so the same rules hold for any language or locale.
//!
//! Verdict resolution is an ordered rule table (`RULES`); the first rule whose guard
//! holds decides. Anything the table cannot place lands on `Generic`, which the
//! verification policy rejects.

use crate::links::{extract_link_candidates, LinkCandidate};
use crate::urlnorm::{host_key, normalize_url};
use regex::Regex;
use sourcegate_core::{PageClassification, PageSignals, PageVerdict};
use std::collections::BTreeSet;
use std::sync::OnceLock;

pub const DEFAULT_LISTING_MIN_PRODUCTS: usize = 3;
pub const MAX_CANDIDATE_LINKS: usize = 50;

const LOW_TEXT_CHARS: usize = 200;
const INTERSTITIAL_TEXT_CHARS: usize = 500;
const MAX_SCRIPTS_ON_EMPTY_PAGE: usize = 5;
const LINK_SCAN_LIMIT: usize = 2_000;

const LISTING_SEGMENTS: &[&str] = &[
    "search",
    "s",
    "category",
    "categories",
    "catalog",
    "catalogue",
    "c",
    "l",
    "list",
    "shop",
    "browse",
    "results",
    "collections",
];

/// Listing collections whose last segment names the collection itself (`/products`, `/items`).
const COLLECTION_ROOTS: &[&str] = &["products", "items", "goods", "offers"];

const LISTING_QUERY_KEYS: &[&str] = &[
    "q",
    "query",
    "search",
    "k",
    "keyword",
    "keywords",
    "text",
    "category",
    "cat",
    "filter",
    "filters",
    "page",
    "pg",
    "sort",
    "sort_by",
    "order",
    "offset",
];

const GENERIC_SEGMENTS: &[&str] = &[
    "home",
    "index",
    "index.html",
    "index.htm",
    "index.php",
    "default.aspx",
    "search",
    "category",
    "categories",
    "catalog",
    "catalogue",
    "shop",
    "products",
    "collections",
];

const CHALLENGE_MARKERS: &[&str] = &[
    "captcha",
    "recaptcha",
    "hcaptcha",
    "turnstile",
    "challenge",
    "verify",
    "verification",
    "bot-check",
    "access-gate",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// Minimum product count for a listing to count as populated.
    pub listing_min_products: usize,
    pub max_candidate_links: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            listing_min_products: DEFAULT_LISTING_MIN_PRODUCTS,
            max_candidate_links: MAX_CANDIDATE_LINKS,
        }
    }
}

fn product_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:/(?:product|products|p|item|items|dp|detail|details|buy|sku|goods|offer)/[^/]+|-\d{4,}\.html?$|_\d{5,}\.html?$|/\d{6,}/?$)",
        )
        .expect("product path regex must compile")
    })
}

fn numeric_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{4,}").expect("numeric id regex must compile"))
}

fn price_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:[$€£¥₴₽₹]\s?\d[\d.,\s]*|\d[\d.,\s]*\s?(?:[$€£¥₴₽₹]|\b(?:usd|eur|gbp|uah|rub|bgn|pln|jpy|cad|aud|chf|sek|inr)\b))",
        )
        .expect("price regex must compile")
    })
}

fn url_path_and_query(url: &str) -> Option<(String, Vec<String>)> {
    let u = url::Url::parse(url).ok()?;
    let keys = u
        .query_pairs()
        .map(|(k, _)| k.to_ascii_lowercase())
        .collect();
    Some((u.path().to_ascii_lowercase(), keys))
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Root, or a single landing segment such as `/home`, `/search`, `/category`.
pub fn is_generic_path(url: &str) -> bool {
    let Some((path, _)) = url_path_and_query(url) else {
        return false;
    };
    match segments(&path).as_slice() {
        [] => true,
        [only] => GENERIC_SEGMENTS.contains(only),
        _ => false,
    }
}

/// Path or query shaped like a search, category or catalog view.
pub fn is_listing_url(url: &str) -> bool {
    let Some((path, query_keys)) = url_path_and_query(url) else {
        return false;
    };
    let segs = segments(&path);
    if segs.iter().any(|s| LISTING_SEGMENTS.contains(s)) {
        return true;
    }
    if segs.last().is_some_and(|s| COLLECTION_ROOTS.contains(s)) {
        return true;
    }
    query_keys
        .iter()
        .any(|k| LISTING_QUERY_KEYS.contains(&k.as_str()))
}

pub fn is_product_path(path: &str) -> bool {
    product_path_re().is_match(path)
}

fn is_listing_path(path: &str) -> bool {
    segments(path).iter().any(|s| {
        matches!(
            *s,
            "search" | "category" | "categories" | "catalog" | "catalogue" | "filter" | "list" | "results"
        )
    })
}

fn is_product_link(link: &LinkCandidate) -> bool {
    let Ok(u) = url::Url::parse(&link.url) else {
        return false;
    };
    let path = u.path().to_ascii_lowercase();
    if is_listing_path(&path) {
        return false;
    }
    if is_product_path(&path) {
        return true;
    }
    let last = segments(&path).last().copied().unwrap_or_default();
    numeric_id_re().is_match(last)
        && (price_re().is_match(&link.text) || price_re().is_match(&link.context))
}

fn json_ld_type_is_product(v: &serde_json::Value) -> bool {
    fn is_product(s: &str) -> bool {
        let s = s.trim();
        s.eq_ignore_ascii_case("Product")
            || s.to_ascii_lowercase().ends_with("schema.org/product")
    }
    match v {
        serde_json::Value::String(s) => is_product(s),
        serde_json::Value::Array(items) => items
            .iter()
            .any(|i| i.as_str().is_some_and(is_product)),
        _ => false,
    }
}

/// Product records in a JSON-LD value, including those nested in `@graph` or item lists.
fn count_json_ld_products(v: &serde_json::Value) -> usize {
    match v {
        serde_json::Value::Object(map) => {
            if map.get("@type").is_some_and(json_ld_type_is_product) {
                return 1;
            }
            map.values().map(count_json_ld_products).sum()
        }
        serde_json::Value::Array(items) => items.iter().map(count_json_ld_products).sum(),
        _ => 0,
    }
}

fn attr_lc(el: &html_scraper::ElementRef, name: &str) -> String {
    el.value()
        .attr(name)
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default()
}

fn has_challenge_marker(el: &html_scraper::ElementRef) -> bool {
    let mut hay = String::new();
    for a in ["class", "id", "action", "src", "name"] {
        hay.push_str(&attr_lc(el, a));
        hay.push(' ');
    }
    CHALLENGE_MARKERS.iter().any(|m| hay.contains(m))
}

struct MarkupSignals {
    json_ld_products: usize,
    microdata_products: usize,
    script_count: usize,
    script_chars: usize,
    challenge_elements: usize,
    meta_refresh: bool,
}

fn scan_markup(doc: &html_scraper::Html) -> MarkupSignals {
    fn sel(s: &str) -> Option<html_scraper::Selector> {
        html_scraper::Selector::parse(s).ok()
    }

    let mut out = MarkupSignals {
        json_ld_products: 0,
        microdata_products: 0,
        script_count: 0,
        script_chars: 0,
        challenge_elements: 0,
        meta_refresh: false,
    };

    if let Some(s) = sel("script") {
        for el in doc.select(&s) {
            let body: String = el.text().collect();
            let ty = attr_lc(&el, "type");
            if ty.trim() == "application/ld+json" {
                if let Ok(v) = serde_json::from_str::<serde_json::Value>(body.trim()) {
                    out.json_ld_products += count_json_ld_products(&v);
                }
                continue;
            }
            out.script_count += 1;
            out.script_chars += body.chars().count();
        }
    }

    if let Some(s) = sel("[itemtype]") {
        out.microdata_products = doc
            .select(&s)
            .filter(|el| {
                attr_lc(el, "itemtype")
                    .split_whitespace()
                    .any(|t| t == "product" || t.ends_with("schema.org/product"))
            })
            .count();
    }

    if let Some(s) = sel("form, div, iframe, section") {
        out.challenge_elements = doc.select(&s).filter(has_challenge_marker).count();
    }

    if let Some(s) = sel("meta[http-equiv]") {
        out.meta_refresh = doc
            .select(&s)
            .any(|el| attr_lc(&el, "http-equiv").trim() == "refresh");
    }

    out
}

fn blocked_reason(s: &PageSignals) -> Option<&'static str> {
    if s.text_chars < LOW_TEXT_CHARS && s.challenge_elements > 0 {
        return Some("low content with challenge elements");
    }
    if s.meta_refresh && s.text_chars < INTERSTITIAL_TEXT_CHARS {
        return Some("meta refresh with low content");
    }
    if s.script_count > MAX_SCRIPTS_ON_EMPTY_PAGE && s.text_chars < LOW_TEXT_CHARS {
        return Some("low content with many scripts");
    }
    None
}

struct Facts<'a> {
    signals: &'a PageSignals,
    empty_markup: bool,
    product_count: usize,
    listing_min: usize,
}

impl Facts<'_> {
    fn structured(&self) -> usize {
        self.signals
            .json_ld_products
            .max(self.signals.microdata_products)
    }

    fn single_product_shape(&self) -> bool {
        !self.signals.listing_url
            && !self.signals.generic_path
            && (self.structured() >= 1 || self.signals.product_url)
    }
}

struct Rule {
    verdict: PageVerdict,
    applies: fn(&Facts) -> bool,
    reason: fn(&Facts) -> String,
}

const RULES: &[Rule] = &[
    Rule {
        verdict: PageVerdict::Blocked,
        applies: |f| blocked_reason(f.signals).is_some(),
        reason: |f| blocked_reason(f.signals).unwrap_or("blocked").to_string(),
    },
    Rule {
        verdict: PageVerdict::Error,
        applies: |f| f.empty_markup,
        reason: |_| "no markup to classify".to_string(),
    },
    Rule {
        verdict: PageVerdict::Product,
        applies: |f| f.single_product_shape() && f.product_count >= 1,
        reason: |f| format!("product page ({} product signals)", f.product_count),
    },
    Rule {
        verdict: PageVerdict::ListingWithProducts,
        applies: |f| f.signals.listing_url && f.product_count >= f.listing_min,
        reason: |f| format!("listing with {} products", f.product_count),
    },
    Rule {
        verdict: PageVerdict::ListingEmpty,
        applies: |f| f.signals.listing_url,
        reason: |f| {
            format!(
                "listing with {} products (minimum {})",
                f.product_count, f.listing_min
            )
        },
    },
    Rule {
        verdict: PageVerdict::Generic,
        applies: |f| f.signals.generic_path,
        reason: |_| "shallow landing page".to_string(),
    },
];

/// Classify one page from its markup, extracted text and resolved URL.
///
/// Deterministic: identical inputs always yield identical output.
pub fn classify_page(
    html: &str,
    text: &str,
    final_url: &str,
    cfg: &ClassifierConfig,
) -> PageClassification {
    let page_url = normalize_url(final_url).unwrap_or_else(|| final_url.trim().to_string());
    let page_host = host_key(&page_url);
    let page_path = url_path_and_query(&page_url)
        .map(|(p, _)| p)
        .unwrap_or_default();

    let mut signals = PageSignals {
        text_chars: text.trim().chars().count(),
        listing_url: is_listing_url(&page_url),
        generic_path: is_generic_path(&page_url),
        product_url: !page_path.is_empty() && is_product_path(&page_path),
        ..PageSignals::default()
    };

    let empty_markup = html.trim().is_empty();
    let mut product_links: Vec<String> = Vec::new();
    if !empty_markup {
        let doc = html_scraper::Html::parse_document(html);
        let m = scan_markup(&doc);
        signals.json_ld_products = m.json_ld_products;
        signals.microdata_products = m.microdata_products;
        signals.script_count = m.script_count;
        signals.script_chars = m.script_chars;
        signals.challenge_elements = m.challenge_elements;
        signals.meta_refresh = m.meta_refresh;

        let mut seen = BTreeSet::new();
        for link in extract_link_candidates(html, Some(&page_url), LINK_SCAN_LIMIT) {
            if link.url == page_url || host_key(&link.url) != page_host {
                continue;
            }
            if is_product_link(&link) && seen.insert(link.url.clone()) {
                product_links.push(link.url);
            }
        }
        signals.product_links = product_links.len();
    }

    let product_count = signals.json_ld_products.max(signals.microdata_products) + signals.product_links;
    let facts = Facts {
        signals: &signals,
        empty_markup,
        product_count,
        listing_min: cfg.listing_min_products.max(1),
    };

    let (verdict, reason) = RULES
        .iter()
        .find(|r| (r.applies)(&facts))
        .map(|r| (r.verdict, (r.reason)(&facts)))
        .unwrap_or_else(|| (PageVerdict::Generic, "no decisive structure".to_string()));

    let product_candidate_links = if signals.listing_url {
        product_links
            .into_iter()
            .take(cfg.max_candidate_links)
            .collect()
    } else {
        Vec::new()
    };

    tracing::debug!(url = %page_url, verdict = %verdict, product_count, "classified page");

    PageClassification {
        verdict,
        product_count,
        reason,
        signals,
        product_candidate_links,
    }
}
