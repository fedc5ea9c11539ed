//! URL normalization shared by cache keys, provenance keys, link extraction and the sanitizer.

const TRACKING_PARAMS: &[&str] = &[
    "gclid",
    "fbclid",
    "msclkid",
    "twclid",
    "li_fat_id",
    "ref",
    "source",
    "affiliate_id",
];

fn is_tracking_param(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    k.starts_with("utm_") || k.starts_with("_ga") || TRACKING_PARAMS.contains(&k.as_str())
}

/// Canonical form of an http(s) URL: lowercase scheme and host, default port dropped,
/// no fragment, no tracking parameters, remaining query pairs sorted, no trailing slash on
/// non-root paths.
///
/// Returns `None` for anything that is not an absolute http(s) URL.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut u = url::Url::parse(raw.trim()).ok()?;
    if !matches!(u.scheme(), "http" | "https") || u.host_str().is_none() {
        return None;
    }
    u.set_fragment(None);

    if u.query().is_some() {
        let mut kept: Vec<(String, String)> = u
            .query_pairs()
            .filter(|(k, _)| !is_tracking_param(k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        kept.sort();
        if kept.is_empty() {
            u.set_query(None);
        } else {
            u.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    let path = u.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        u.set_path(path.trim_end_matches('/'));
    }
    Some(u.to_string())
}

/// `normalize_url`, falling back to the trimmed input so callers always get a key.
pub fn normalize_or_raw(raw: &str) -> String {
    normalize_url(raw).unwrap_or_else(|| raw.trim().to_string())
}

/// Lowercased host without a leading `www.`.
pub fn host_key(raw: &str) -> Option<String> {
    let u = url::Url::parse(raw.trim()).ok()?;
    let host = u.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Normalized form of a search query, used as its cache key.
pub fn normalize_query(q: &str) -> String {
    q.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
