//! Immutable parsed document snapshot.
//!
//! A `DocumentTree` is built once from markup and never mutated afterwards;
//! rendering a page produces a second, independent tree.

use crate::template::{Captures, Template};
use crate::xpath::{Selected, XPath};
use crate::{Error, Result};
use ego_tree::{NodeId, NodeRef};
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};
use regex::bytes::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use std::sync::OnceLock;

/// Tags whose text never shows up on screen
const HIDDEN_TAGS: &[&str] = &["script", "style", "noscript", "template", "head"];

/// Tags that start a new line of visible text
const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "fieldset",
    "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr",
    "li", "main", "nav", "ol", "p", "pre", "section", "table", "tr", "td", "th", "ul", "title",
    "body", "html",
];

/// How far into the document to look for a `<meta>` charset declaration
const META_SNIFF_LIMIT: usize = 1024;

static META_CHARSET: OnceLock<Option<Regex>> = OnceLock::new();

fn meta_charset_regex() -> Option<&'static Regex> {
    META_CHARSET
        .get_or_init(|| {
            Regex::new(r#"(?i)<meta[^>]*?charset\s*=\s*["']?\s*([a-z0-9_:.\-]+)"#).ok()
        })
        .as_ref()
}

fn sniff_meta(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(META_SNIFF_LIMIT)];
    let caps = meta_charset_regex()?.captures(head)?;
    let enc = Encoding::for_label(caps.get(1)?.as_bytes())?;
    // A meta tag can't sensibly declare UTF-16: the parser already read it as ASCII.
    if enc == UTF_16LE || enc == UTF_16BE {
        Some(UTF_8)
    } else {
        Some(enc)
    }
}

/// Pick the encoding for a document: BOM, then the declared (transport)
/// encoding, then a `<meta>` declaration, then `fallback`.
pub fn detect_encoding(
    bytes: &[u8],
    declared: Option<&str>,
    fallback: &'static Encoding,
) -> &'static Encoding {
    if let Some((enc, _)) = Encoding::for_bom(bytes) {
        return enc;
    }
    if let Some(enc) = declared.and_then(|label| Encoding::for_label(label.trim().as_bytes())) {
        return enc;
    }
    sniff_meta(bytes).unwrap_or(fallback)
}

/// A parsed, immutable HTML document
pub struct DocumentTree {
    html: Html,
    source: String,
    encoding: &'static Encoding,
}

impl std::fmt::Debug for DocumentTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentTree")
            .field("encoding", &self.encoding.name())
            .field("bytes", &self.source.len())
            .finish()
    }
}

impl DocumentTree {
    /// Parse raw bytes. Unknown or missing encodings fall back to UTF-8 and
    /// undecodable bytes become U+FFFD; this never fails.
    pub fn parse(bytes: &[u8], declared_encoding: Option<&str>) -> Self {
        Self::parse_with_fallback(bytes, declared_encoding, UTF_8)
    }

    /// Like [`DocumentTree::parse`] with an explicit last-resort encoding
    pub fn parse_with_fallback(
        bytes: &[u8],
        declared_encoding: Option<&str>,
        fallback: &'static Encoding,
    ) -> Self {
        let encoding = detect_encoding(bytes, declared_encoding, fallback);
        let (text, used, _had_errors) = encoding.decode(bytes);
        Self {
            html: Html::parse_document(&text),
            source: text.into_owned(),
            encoding: used,
        }
    }

    /// Parse already-decoded markup
    pub fn from_markup(markup: &str) -> Self {
        Self {
            html: Html::parse_document(markup),
            source: markup.to_string(),
            encoding: UTF_8,
        }
    }

    /// The underlying `scraper` document
    pub fn html(&self) -> &Html {
        &self.html
    }

    /// Decoded markup this tree was built from
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Markup re-serialized from the parsed tree
    pub fn raw_html(&self) -> String {
        self.html.root_element().html()
    }

    /// Name of the encoding used to decode the source (e.g. `"UTF-8"`)
    pub fn encoding(&self) -> &'static str {
        self.encoding.name()
    }

    /// The document node
    pub fn root(&self) -> NodeId {
        self.html.tree.root().id()
    }

    /// The `<html>` element
    pub fn root_element(&self) -> NodeId {
        self.html.root_element().id()
    }

    pub(crate) fn node(&self, id: NodeId) -> Option<NodeRef<'_, Node>> {
        self.html.tree.get(id)
    }

    pub(crate) fn element(&self, id: NodeId) -> Option<ElementRef<'_>> {
        self.node(id).and_then(ElementRef::wrap)
    }

    /// Visible text of the whole document, one line per block
    pub fn text(&self) -> String {
        self.node_text(self.root())
    }

    /// Every text node of the document concatenated, scripts included
    pub fn full_text(&self) -> String {
        self.node_full_text(self.root())
    }

    pub(crate) fn node_text(&self, id: NodeId) -> String {
        match self.node(id) {
            Some(node) => visible_text(node),
            None => String::new(),
        }
    }

    pub(crate) fn node_full_text(&self, id: NodeId) -> String {
        match self.node(id) {
            Some(node) => node
                .descendants()
                .filter_map(|n| n.value().as_text().map(|t| t.to_string()))
                .collect(),
            None => String::new(),
        }
    }

    /// Select element nodes from the whole document with a CSS selector or an
    /// XPath expression. XPath hits that are not elements are dropped.
    pub fn select(&self, query: &str, is_xpath: bool) -> Result<Vec<NodeId>> {
        if is_xpath {
            Ok(self
                .select_xpath(self.root(), query)?
                .into_iter()
                .filter_map(|s| match s {
                    Selected::Node(id) => Some(id),
                    Selected::Value(_) => None,
                })
                .collect())
        } else {
            self.select_css(self.root(), query)
        }
    }

    /// CSS selection below `scope` (the scope node itself is never returned
    /// unless `scope` is the document node)
    pub fn select_css(&self, scope: NodeId, selector: &str) -> Result<Vec<NodeId>> {
        let sel = parse_selector(selector)?;
        if scope == self.root() {
            return Ok(self.html.select(&sel).map(|e| e.id()).collect());
        }
        match self.element(scope) {
            Some(el) => Ok(el.select(&sel).map(|e| e.id()).filter(|id| *id != scope).collect()),
            None => Ok(Vec::new()),
        }
    }

    /// XPath evaluation with `context` as the context node
    pub fn select_xpath(&self, context: NodeId, expr: &str) -> Result<Vec<Selected>> {
        XPath::parse(expr)?.evaluate(&self.html.tree, context)
    }

    /// Run a search template over the document's visible text
    pub fn search_pattern(&self, template: &str) -> Result<Vec<Captures>> {
        Ok(Template::parse(template)?.search_all(&self.text()))
    }
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| Error::Selector(format!("{:?}: {:?}", selector, e)))
}

/// Visible text below `node`: hidden elements are skipped, whitespace runs
/// collapse to one space and block elements break lines.
pub(crate) fn visible_text(node: NodeRef<'_, Node>) -> String {
    let mut raw = String::new();
    match node.value() {
        Node::Text(t) => raw.push_str(t),
        _ => collect_visible(node, &mut raw),
    }
    raw.split('\n')
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_visible(node: NodeRef<'_, Node>, out: &mut String) {
    for child in node.children() {
        match child.value() {
            Node::Text(t) => {
                out.extend(t.chars().map(|c| if c.is_whitespace() { ' ' } else { c }));
            }
            Node::Element(el) => {
                let name = el.name();
                if HIDDEN_TAGS.contains(&name) {
                    continue;
                }
                let block = BLOCK_TAGS.contains(&name);
                if block {
                    out.push('\n');
                }
                collect_visible(child, out);
                if block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_selects_in_document_order() {
        let tree = DocumentTree::from_markup("<ul><li>a</li><li>b</li><li>c</li></ul>");
        let ids = tree.select("li", false).unwrap();
        let texts: Vec<_> = ids.iter().map(|id| tree.node_text(*id)).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert_eq!(tree.select("//li", true).unwrap(), ids);
    }

    #[test]
    fn invalid_declared_encoding_degrades_gracefully() {
        let bytes = b"<html><body><p>caf\xe9 ok</p></body></html>";
        let tree = DocumentTree::parse(bytes, Some("definitely-not-a-charset"));
        assert_eq!(tree.encoding(), "UTF-8");
        assert!(tree.text().contains("caf\u{fffd} ok"));
    }

    #[test]
    fn declared_encoding_is_honoured() {
        let bytes = b"<p>caf\xe9</p>";
        let tree = DocumentTree::parse(bytes, Some("latin1"));
        assert_eq!(tree.encoding(), "windows-1252");
        assert_eq!(tree.text(), "caf\u{e9}");
    }

    #[test]
    fn meta_charset_is_sniffed() {
        let bytes = b"<html><head><meta charset=\"iso-8859-1\"></head><body>na\xefve</body></html>";
        let tree = DocumentTree::parse(bytes, None);
        assert_eq!(tree.text(), "na\u{ef}ve");
    }

    #[test]
    fn bom_wins_over_declaration() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice("<p>\u{e9}t\u{e9}</p>".as_bytes());
        let tree = DocumentTree::parse(&bytes, Some("latin1"));
        assert_eq!(tree.encoding(), "UTF-8");
        assert_eq!(tree.text(), "\u{e9}t\u{e9}");
    }

    #[test]
    fn visible_text_skips_scripts_and_breaks_blocks() {
        let tree = DocumentTree::from_markup(
            "<html><head><title>T</title><style>p{}</style></head><body>\
             <p>Hello\n   <b>big</b> world</p><script>var x = 1;</script><div>next</div></body></html>",
        );
        assert_eq!(tree.text(), "Hello big world\nnext");
        assert!(tree.full_text().contains("var x = 1;"));
    }

    #[test]
    fn malformed_markup_still_parses() {
        let tree = DocumentTree::from_markup("<div><p>unclosed <b>bold<div>x");
        assert!(!tree.select("b", false).unwrap().is_empty());
    }

    #[test]
    fn bad_css_selector_fails_immediately() {
        let tree = DocumentTree::from_markup("<p>x</p>");
        assert!(matches!(tree.select("p[", false), Err(Error::Selector(_))));
    }

    #[test]
    fn search_pattern_scans_visible_text() {
        let tree = DocumentTree::from_markup("<p>Price: 10 EUR</p><p>Price: 12 EUR</p>");
        let hits = tree.search_pattern("Price: {p} EUR").unwrap();
        let prices: Vec<_> = hits.iter().filter_map(|c| c.get("p")).collect();
        assert_eq!(prices, vec!["10", "12"]);
    }

    #[test]
    fn scoped_css_excludes_scope_itself() {
        let tree = DocumentTree::from_markup("<div class='x'><div class='x'>inner</div></div>");
        let outer = tree.select("div.x", false).unwrap()[0];
        let inner = tree.select_css(outer, "div.x").unwrap();
        assert_eq!(inner.len(), 1);
        assert_ne!(inner[0], outer);
    }
}
