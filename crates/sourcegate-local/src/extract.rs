use std::io::Cursor;

pub fn html_to_text(html: &str, width: usize) -> String {
    // html2text expects bytes; Cursor avoids allocating a second large buffer.
    let cleaned = strip_tag_blocks(&strip_tag_blocks(html, "script"), "style");
    let text = html2text::from_read(Cursor::new(cleaned.as_bytes()), width)
        .unwrap_or_else(|_| cleaned.clone());
    if has_any_text(&text) {
        text
    } else {
        html_hint_text(html, 2_000)
    }
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn has_any_text(s: &str) -> bool {
    s.chars().any(|c| !c.is_whitespace())
}

/// `<title>`, else `og:title`, else the first `<h1>`.
pub fn html_title(html: &str) -> Option<String> {
    let doc = html_scraper::Html::parse_document(html);
    first_text(&doc, "title")
        .or_else(|| first_attr(&doc, "meta[property=\"og:title\"]", "content"))
        .or_else(|| first_text(&doc, "h1"))
}

fn first_text(doc: &html_scraper::Html, selector: &str) -> Option<String> {
    let sel = html_scraper::Selector::parse(selector).ok()?;
    let el = doc.select(&sel).next()?;
    let t = norm_ws(&el.text().collect::<Vec<_>>().join(" "));
    (!t.is_empty()).then_some(t)
}

fn first_attr(doc: &html_scraper::Html, selector: &str, attr: &str) -> Option<String> {
    let sel = html_scraper::Selector::parse(selector).ok()?;
    let el = doc.select(&sel).next()?;
    let v = el.value().attr(attr)?.trim().to_string();
    (!v.is_empty()).then_some(v)
}

/// Title, meta descriptions and first headings; the only text on many script-built shells.
pub fn html_hint_text(html: &str, max_chars: usize) -> String {
    let doc = html_scraper::Html::parse_document(html);
    let mut parts = Vec::new();
    parts.extend(first_text(&doc, "title"));
    parts.extend(first_attr(&doc, "meta[name=\"description\"]", "content"));
    parts.extend(first_attr(&doc, "meta[property=\"og:description\"]", "content"));
    parts.extend(first_text(&doc, "h1"));
    parts.extend(first_text(&doc, "h2"));
    truncate_chars(&parts.join("\n"), max_chars).0
}

pub fn truncate_chars(s: &str, max_chars: usize) -> (String, bool) {
    if max_chars == 0 {
        return ("".to_string(), !s.is_empty());
    }
    let mut out = String::new();
    for (n, ch) in s.chars().enumerate() {
        if n >= max_chars {
            return (out, true);
        }
        out.push(ch);
    }
    (out, false)
}

/// Whitespace-collapsed prefix of `text`, with an ellipsis when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    let (mut out, clipped) = truncate_chars(&norm_ws(text), max_chars);
    if clipped {
        out.push_str("...");
    }
    out
}

fn strip_tag_blocks(html: &str, tag: &str) -> String {
    // Only removes a block when its close tag is found; ASCII-case-insensitive on tag names.
    let open_pat = format!("<{}", tag.to_ascii_lowercase());
    let close_pat = format!("</{}>", tag.to_ascii_lowercase());

    let mut out = String::new();
    let mut i = 0usize;
    let lower = html.to_ascii_lowercase();
    while let Some(rel_start) = lower[i..].find(&open_pat) {
        let start = i + rel_start;
        let after_open = start + open_pat.len();
        if let Some(rel_end) = lower[after_open..].find(&close_pat) {
            let end = after_open + rel_end + close_pat.len();
            out.push_str(&html[i..start]);
            i = end;
        } else {
            break;
        }
    }
    out.push_str(&html[i..]);
    out
}
