use crate::urlnorm::normalize_url;
use std::collections::BTreeMap;

const MAX_LINKS_CAP: usize = 2_000;
const CONTEXT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCandidate {
    /// Normalized absolute URL.
    pub url: String,
    /// Anchor text; text of repeated anchors to the same URL is merged.
    pub text: String,
    /// Text of the anchor's parent element (bounded), where card layouts keep prices.
    pub context: String,
}

fn collapse(parts: impl Iterator<Item = impl AsRef<str>>) -> String {
    let mut out = String::new();
    for p in parts {
        for w in p.as_ref().split_whitespace() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(w);
        }
    }
    out
}

fn resolve(href: &str, base: Option<&url::Url>) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let href_lc = href.to_ascii_lowercase();
    if href_lc.starts_with("javascript:")
        || href_lc.starts_with("mailto:")
        || href_lc.starts_with("tel:")
        || href_lc.starts_with("data:")
    {
        return None;
    }
    let abs = match url::Url::parse(href) {
        Ok(u) => u,
        Err(_) => base?.join(href).ok()?,
    };
    normalize_url(abs.as_str())
}

/// Extract deduplicated absolute links from HTML, in document order.
///
/// Relative links are resolved against `base_url`; fragments and tracking
/// parameters are dropped; at most `max_links` are returned.
pub fn extract_links(html: &str, base_url: Option<&str>, max_links: usize) -> Vec<String> {
    extract_link_candidates(html, base_url, max_links)
        .into_iter()
        .map(|c| c.url)
        .collect()
}

/// Like [`extract_links`], keeping anchor text and parent-element context per URL.
pub fn extract_link_candidates(
    html: &str,
    base_url: Option<&str>,
    max_links: usize,
) -> Vec<LinkCandidate> {
    let max_links = max_links.min(MAX_LINKS_CAP);
    if max_links == 0 {
        return Vec::new();
    }

    let base = base_url.and_then(|u| url::Url::parse(u).ok());
    let doc = html_scraper::Html::parse_document(html);
    let sel = match html_scraper::Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    let mut out: Vec<LinkCandidate> = Vec::new();
    for el in doc.select(&sel) {
        let Some(url) = el
            .value()
            .attr("href")
            .and_then(|h| resolve(h, base.as_ref()))
        else {
            continue;
        };

        let text = collapse(el.text());
        let context = el
            .parent()
            .and_then(html_scraper::ElementRef::wrap)
            .map(|p| collapse(p.text()))
            .map(|c| c.chars().take(CONTEXT_CHARS).collect::<String>())
            .unwrap_or_default();

        if let Some(&i) = index.get(&url) {
            let existing = &mut out[i];
            if !text.is_empty() && !existing.text.contains(&text) {
                if !existing.text.is_empty() {
                    existing.text.push(' ');
                }
                existing.text.push_str(&text);
            }
            if existing.context.is_empty() {
                existing.context = context;
            }
            continue;
        }
        if out.len() >= max_links {
            continue;
        }
        index.insert(url.clone(), out.len());
        out.push(LinkCandidate { url, text, context });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_resolves_links() {
        let html = r#"
        <html><body>
          <a href="/a#x">A</a>
          <a href="https://example.com/b?utm_source=nl">B</a>
          <a href="mailto:test@example.com">mail</a>
          <a href="javascript:void(0)">js</a>
        </body></html>
        "#;
        let links = extract_links(html, Some("https://example.com/root"), 10);
        assert_eq!(
            links,
            vec![
                "https://example.com/a".to_string(),
                "https://example.com/b".to_string()
            ]
        );
    }

    #[test]
    fn relative_links_without_base_are_skipped() {
        let links = extract_links(r#"<a href="/only-relative">x</a>"#, None, 10);
        assert!(links.is_empty());
    }

    #[test]
    fn duplicate_anchors_merge_text() {
        let html = r#"
          <div class="card"><a href="/p/1"><img src="x.jpg"></a>
          <a href="/p/1">Blue Widget</a> <span>$19.99</span></div>
        "#;
        let links = extract_link_candidates(html, Some("https://shop.example/"), 10);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].text, "Blue Widget");
        assert!(links[0].context.contains("$19.99"));
    }

    #[test]
    fn max_links_caps_distinct_urls() {
        let html: String = (0..20)
            .map(|i| format!(r#"<a href="/p/{i}">{i}</a>"#))
            .collect();
        let links = extract_links(&html, Some("https://example.com/"), 5);
        assert_eq!(links.len(), 5);
        assert_eq!(links[0], "https://example.com/p/0");
        assert!(extract_links(&html, Some("https://example.com/"), 0).is_empty());
    }
}
