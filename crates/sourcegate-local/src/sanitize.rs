use crate::urlnorm::{host_key, normalize_url};
use regex::{Captures, Regex};
use sourcegate_core::VerifiedMeta;
use std::collections::BTreeSet;
use std::sync::OnceLock;

pub const REMOVED_URL_MARKER: &str = "[URL removed - not verified]";

const TRAILING_PUNCT: &[char] = &['.', ',', ';', ':', '!', '?', ']', '}', '*', '_', '`'];

// Parentheses are part of a URL only as a balanced pair, as in `/wiki/Foo_(bar)`.
fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)https?://(?:[^\s<>"'()\[\]{}]|\([^\s<>"'()\[\]{}]*\))+"#)
            .expect("url regex must compile")
    })
}

/// Strip trailing punctuation; a closing paren goes only when it has no opening partner.
fn trim_url_tail(raw: &str) -> &str {
    let mut url = raw;
    loop {
        let Some(last) = url.chars().last() else {
            return url;
        };
        let strip = if last == ')' {
            url.matches('(').count() < url.matches(')').count()
        } else {
            TRAILING_PUNCT.contains(&last)
        };
        if !strip {
            return url;
        }
        url = &url[..url.len() - last.len_utf8()];
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sanitized {
    pub text: String,
    pub kept: usize,
    pub substituted: usize,
    pub removed: usize,
}

/// Rewrite every URL in `text` so that only verified URLs remain.
///
/// An exact (normalized) match is left as written; a URL on the host of a verified page
/// is replaced by the first verified URL on that host; anything else becomes
/// [`REMOVED_URL_MARKER`]. Trailing punctuation stays outside the rewrite.
pub fn sanitize_answer(text: &str, verified: &[VerifiedMeta]) -> Sanitized {
    let exact: BTreeSet<&str> = verified.iter().map(|m| m.url.as_str()).collect();
    let mut out = Sanitized::default();

    let rewritten = url_re().replace_all(text, |caps: &Captures| {
        let raw = &caps[0];
        let url = trim_url_tail(raw);
        let tail = &raw[url.len()..];

        let normalized = normalize_url(url);
        if normalized.as_deref().is_some_and(|n| exact.contains(n)) {
            out.kept += 1;
            return raw.to_string();
        }

        let host = normalized.as_deref().and_then(host_key);
        let same_host = host.and_then(|h| {
            verified
                .iter()
                .find(|m| host_key(&m.url).as_deref() == Some(h.as_str()))
        });
        match same_host {
            Some(m) => {
                out.substituted += 1;
                format!("{}{tail}", m.url)
            }
            None => {
                out.removed += 1;
                format!("{REMOVED_URL_MARKER}{tail}")
            }
        }
    });

    out.text = rewritten.into_owned();
    out
}

/// URL-shaped substrings of `text`, trailing punctuation stripped.
pub fn find_urls(text: &str) -> Vec<&str> {
    url_re()
        .find_iter(text)
        .map(|m| trim_url_tail(m.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sourcegate_core::PageVerdict;

    fn verified(urls: &[&str]) -> Vec<VerifiedMeta> {
        urls.iter()
            .map(|u| VerifiedMeta {
                url: normalize_url(u).unwrap(),
                title: "t".to_string(),
                verdict: PageVerdict::Product,
                product_count: 1,
                reason: "r".to_string(),
            })
            .collect()
    }

    #[test]
    fn verified_urls_survive_as_written() {
        let v = verified(&["https://shop.example/p/1"]);
        let s = sanitize_answer("See https://shop.example/p/1?utm_source=x.", &v);
        assert_eq!(s.text, "See https://shop.example/p/1?utm_source=x.");
        assert_eq!(s.kept, 1);
    }

    #[test]
    fn unverified_urls_are_removed() {
        let s = sanitize_answer("Buy at https://scam.example/deal!", &[]);
        assert_eq!(s.text, format!("Buy at {REMOVED_URL_MARKER}!"));
        assert_eq!(s.removed, 1);
    }

    #[test]
    fn same_host_urls_are_substituted() {
        let v = verified(&["https://shop.example/p/1", "https://shop.example/p/2"]);
        let s = sanitize_answer(
            "Options: (https://www.shop.example/p/9), [x](http://shop.example/other).",
            &v,
        );
        assert_eq!(
            s.text,
            "Options: (https://shop.example/p/1), [x](https://shop.example/p/1)."
        );
        assert_eq!(s.substituted, 2);
    }

    #[test]
    fn verified_urls_with_parentheses_are_kept_whole() {
        let url = "https://shop.example/p/widget_(blue)";
        let v = verified(&[url]);

        let s = sanitize_answer(&format!("See {url} now"), &v);
        assert_eq!(s.text, format!("See {url} now"));
        assert_eq!(s.kept, 1);

        let md = format!("Pick [the blue one]({url}), or ({url}).");
        let s = sanitize_answer(&md, &v);
        assert_eq!(s.text, md);
        assert_eq!((s.kept, s.substituted, s.removed), (2, 0, 0));
    }

    #[test]
    fn unbalanced_closing_paren_stays_outside_the_url() {
        assert_eq!(trim_url_tail("https://x.example/a_(b))."), "https://x.example/a_(b)");
        assert_eq!(trim_url_tail("https://x.example/a)"), "https://x.example/a");
        assert_eq!(
            find_urls("see (https://x.example/wiki/Foo_(bar))"),
            vec!["https://x.example/wiki/Foo_(bar)"]
        );
    }

    #[test]
    fn text_without_urls_is_unchanged() {
        let s = sanitize_answer("No links here: just text.", &verified(&["https://a.example/p/1"]));
        assert_eq!(s.text, "No links here: just text.");
        assert_eq!(s, Sanitized { text: s.text.clone(), ..Sanitized::default() });
    }

    #[test]
    fn find_urls_strips_trailing_punctuation() {
        assert_eq!(
            find_urls("a https://x.example/a, b (http://y.example/b)."),
            vec!["https://x.example/a", "http://y.example/b"]
        );
    }

    proptest! {
        #[test]
        fn no_foreign_url_survives(
            words in proptest::collection::vec(
                prop_oneof![
                    "[a-z]{1,8}",
                    "https://(shop|scam|other)\\.example/[a-z0-9/]{0,10}[.,!?]?",
                    "http://[a-z]{1,5}\\.test/[a-z]{0,5}",
                ],
                0..20,
            )
        ) {
            let v = verified(&["https://shop.example/p/1", "https://other.example/q"]);
            let allowed: BTreeSet<String> = v.iter().map(|m| m.url.clone()).collect();
            let text = words.join(" ");
            let s = sanitize_answer(&text, &v);
            for url in find_urls(&s.text) {
                let n = normalize_url(url).unwrap_or_default();
                prop_assert!(allowed.contains(&n), "foreign url {url:?} in {:?}", s.text);
            }
        }
    }
}
