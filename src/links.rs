//! Link filtering and URL resolution

use url::Url;

/// Anchor texts that suggest a link to the next page of a listing
pub const DEFAULT_NEXT_SYMBOLS: &[&str] = &["next", "more", "older"];

/// Resolve `href` against `base`.
///
/// Relative, scheme-relative and fragment-only references follow standard URL
/// resolution; a fragment-only reference keeps the base exactly as written.
/// Returns `None` when the base or the joined result is not a valid URL.
///
/// ```
/// assert_eq!(rfhtml::resolve("https://example.com/a/b", "../c").as_deref(), Some("https://example.com/c"));
/// assert_eq!(rfhtml::resolve("https://example.com", "#frag").as_deref(), Some("https://example.com#frag"));
/// assert_eq!(rfhtml::resolve("not a url", "/x"), None);
/// ```
pub fn resolve(base: &str, href: &str) -> Option<String> {
    let base = base.trim();
    let parsed = Url::parse(base).ok()?;
    let href = href.trim();
    if let Some(fragment) = href.strip_prefix('#') {
        let without_fragment = base.split('#').next().unwrap_or(base);
        return Some(format!("{}#{}", without_fragment, fragment));
    }
    resolve_url(&parsed, href)
}

/// Resolve `href` against an already-parsed base
pub fn resolve_url(base: &Url, href: &str) -> Option<String> {
    base.join(href.trim()).ok().map(String::from)
}

/// Returns the trimmed href when it points somewhere worth following: empty
/// hrefs, in-page anchors and `javascript:` / `mailto:` links are skipped.
pub fn followable(href: &str) -> Option<&str> {
    let href = href.trim();
    let lower = href.to_ascii_lowercase();
    if href.is_empty()
        || href.starts_with('#')
        || lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
    {
        None
    } else {
        Some(href)
    }
}

/// What next-page discovery needs to know about an anchor
#[derive(Debug, Clone, Default)]
pub struct LinkCandidate {
    pub href: Option<String>,
    pub rel: Vec<String>,
    pub classes: Vec<String>,
}

/// Choose the most likely "next page" href among anchors whose text matched a
/// next-symbol: `rel="next"` first, then a class mentioning `next`, then an
/// href mentioning `page`, else the last candidate.
pub fn pick_next(candidates: &[LinkCandidate]) -> Option<String> {
    for c in candidates {
        let Some(href) = c.href.as_deref().filter(|h| !h.is_empty()) else {
            continue;
        };
        if c.rel.iter().any(|r| r == "next")
            || c.classes.iter().any(|cls| cls.contains("next"))
            || href.contains("page")
        {
            return Some(href.to_string());
        }
    }
    candidates.last().and_then(|c| c.href.clone())
}
