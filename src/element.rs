//! Element handles and the query surface shared by elements and documents

use crate::links;
use crate::template::{Captures, Template};
use crate::tree::DocumentTree;
use crate::xpath::Selected;
use crate::Result;
use ego_tree::NodeId;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Index;
use std::rc::Rc;
use url::Url;

/// Attributes whose value is split on whitespace into a token list
pub const MULTI_VALUED_ATTRS: &[&str] = &["class", "rel"];

/// An attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// Plain string value
    Text(String),
    /// Whitespace-separated tokens (`class`, `rel`)
    List(Vec<String>),
}

impl AttrValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            AttrValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            AttrValue::List(l) => Some(l),
            AttrValue::Text(_) => None,
        }
    }
}

impl PartialEq<str> for AttrValue {
    fn eq(&self, other: &str) -> bool {
        self.as_text() == Some(other)
    }
}

impl PartialEq<&str> for AttrValue {
    fn eq(&self, other: &&str) -> bool {
        self.as_text() == Some(*other)
    }
}

/// Attributes of an element, keyed by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attrs(BTreeMap<String, AttrValue>);

impl Attrs {
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    /// String value of a single-valued attribute
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttrValue::as_text)
    }

    /// Tokens of a multi-valued attribute; empty when absent
    pub fn list(&self, name: &str) -> &[String] {
        self.get(name).and_then(AttrValue::as_list).unwrap_or(&[])
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Index<&str> for Attrs {
    type Output = AttrValue;

    fn index(&self, name: &str) -> &AttrValue {
        match self.0.get(name) {
            Some(v) => v,
            None => panic!("element has no attribute `{}`", name),
        }
    }
}

/// Options for [`Element::find_with`] and `Document::find_with`
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Keep only elements whose full text contains one of these
    /// (case-insensitive)
    pub containing: Vec<String>,
    /// Return only the first match
    pub first: bool,
}

impl FindOptions {
    pub fn first() -> Self {
        Self { first: true, ..Default::default() }
    }

    pub fn containing<I, S>(needles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { containing: needles.into_iter().map(Into::into).collect(), first: false }
    }
}

/// Result of a find: a single optional element when `first` was requested,
/// otherwise every match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    First(Option<Element>),
    All(Vec<Element>),
}

impl Selection {
    pub fn into_vec(self) -> Vec<Element> {
        match self {
            Selection::First(e) => e.into_iter().collect(),
            Selection::All(v) => v,
        }
    }

    pub fn first(self) -> Option<Element> {
        match self {
            Selection::First(e) => e,
            Selection::All(v) => v.into_iter().next(),
        }
    }
}

/// One XPath result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XPathItem {
    Element(Element),
    /// Attribute value, text node or computed scalar
    Text(String),
}

impl XPathItem {
    pub fn as_element(&self) -> Option<&Element> {
        match self {
            XPathItem::Element(e) => Some(e),
            XPathItem::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            XPathItem::Text(s) => Some(s),
            XPathItem::Element(_) => None,
        }
    }
}

/// Query surface over one subtree of a document
pub(crate) struct Query<'a> {
    pub(crate) tree: &'a Rc<DocumentTree>,
    pub(crate) scope: NodeId,
    pub(crate) url: &'a Url,
}

impl<'a> Query<'a> {
    fn wrap(&self, node: NodeId) -> Element {
        Element { tree: Rc::clone(self.tree), node, url: self.url.clone() }
    }

    pub(crate) fn find_with(&self, selector: &str, opts: &FindOptions) -> Result<Selection> {
        let needles: Vec<String> = opts.containing.iter().map(|c| c.to_lowercase()).collect();
        let mut found = self
            .tree
            .select_css(self.scope, selector)?
            .into_iter()
            .map(|id| self.wrap(id))
            .filter(|el| {
                if needles.is_empty() {
                    return true;
                }
                let text = el.full_text().to_lowercase();
                needles.iter().any(|n| text.contains(n.as_str()))
            });
        Ok(if opts.first {
            Selection::First(found.next())
        } else {
            Selection::All(found.collect())
        })
    }

    pub(crate) fn xpath(&self, expr: &str) -> Result<Vec<XPathItem>> {
        Ok(self
            .tree
            .select_xpath(self.scope, expr)?
            .into_iter()
            .map(|s| match s {
                Selected::Node(id) => XPathItem::Element(self.wrap(id)),
                Selected::Value(v) => XPathItem::Text(v),
            })
            .collect())
    }

    pub(crate) fn text(&self) -> String {
        self.tree.node_text(self.scope)
    }

    pub(crate) fn search(&self, template: &str) -> Result<Option<Captures>> {
        Ok(Template::parse(template)?.search(&self.text()))
    }

    pub(crate) fn search_all(&self, template: &str) -> Result<Vec<Captures>> {
        Ok(Template::parse(template)?.search_all(&self.text()))
    }

    /// Document URL, overridden by a `<base href>` anywhere in the document
    pub(crate) fn base_url(&self) -> Url {
        let base_href = self
            .tree
            .select_css(self.tree.root(), "base[href]")
            .ok()
            .and_then(|ids| ids.into_iter().next())
            .and_then(|id| self.tree.element(id))
            .and_then(|el| el.value().attr("href").map(str::trim).map(str::to_string))
            .filter(|h| !h.is_empty());
        base_href
            .and_then(|h| self.url.join(&h).ok())
            .unwrap_or_else(|| self.url.clone())
    }

    pub(crate) fn links(&self) -> BTreeSet<String> {
        let mut anchors = self.tree.select_css(self.scope, "a").unwrap_or_default();
        if self.tree.element(self.scope).map_or(false, |e| e.value().name() == "a") {
            anchors.insert(0, self.scope);
        }
        anchors
            .into_iter()
            .filter_map(|id| self.tree.element(id))
            .filter_map(|el| el.value().attr("href").and_then(links::followable).map(str::to_string))
            .collect()
    }

    pub(crate) fn absolute_links(&self) -> BTreeSet<String> {
        let base = self.base_url();
        self.links()
            .iter()
            .filter_map(|href| links::resolve_url(&base, href))
            .collect()
    }
}

/// A handle to one element of a [`DocumentTree`].
///
/// Elements share their tree; deriving new elements with `find` never copies
/// or mutates it. Two elements are equal when they point at the same node of
/// the same tree instance.
#[derive(Clone)]
pub struct Element {
    tree: Rc<DocumentTree>,
    node: NodeId,
    url: Url,
}

impl Element {
    fn query(&self) -> Query<'_> {
        Query { tree: &self.tree, scope: self.node, url: &self.url }
    }

    /// The tree this element lives in
    pub fn tree(&self) -> &Rc<DocumentTree> {
        &self.tree
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// URL of the document this element came from
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Lower-case tag name
    pub fn tag(&self) -> &str {
        self.tree.element(self.node).map(|e| e.value().name()).unwrap_or_default()
    }

    /// Raw attribute value
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.tree.element(self.node).and_then(|e| e.value().attr(name))
    }

    /// All attributes; `class` and `rel` are split into token lists
    pub fn attrs(&self) -> Attrs {
        let mut map = BTreeMap::new();
        if let Some(el) = self.tree.element(self.node) {
            for (name, value) in el.value().attrs() {
                let v = if MULTI_VALUED_ATTRS.contains(&name) {
                    AttrValue::List(value.split_whitespace().map(str::to_string).collect())
                } else {
                    AttrValue::Text(value.to_string())
                };
                map.insert(name.to_string(), v);
            }
        }
        Attrs(map)
    }

    /// Visible text, whitespace-normalized
    pub fn text(&self) -> String {
        self.query().text()
    }

    /// All descendant text, verbatim
    pub fn full_text(&self) -> String {
        self.tree.node_full_text(self.node)
    }

    /// Serialized markup of this element and its subtree
    pub fn raw_html(&self) -> String {
        self.tree.element(self.node).map(|e| e.html()).unwrap_or_default()
    }

    /// Serialized markup of this element's children
    pub fn inner_html(&self) -> String {
        self.tree.element(self.node).map(|e| e.inner_html()).unwrap_or_default()
    }

    /// Descendants matching a CSS selector, in document order
    pub fn find(&self, selector: &str) -> Result<Vec<Element>> {
        Ok(self.query().find_with(selector, &FindOptions::default())?.into_vec())
    }

    /// First descendant matching a CSS selector, if any
    pub fn find_first(&self, selector: &str) -> Result<Option<Element>> {
        Ok(self.query().find_with(selector, &FindOptions::first())?.first())
    }

    pub fn find_with(&self, selector: &str, opts: &FindOptions) -> Result<Selection> {
        self.query().find_with(selector, opts)
    }

    /// Evaluate an XPath expression with this element as the context node
    pub fn xpath(&self, expr: &str) -> Result<Vec<XPathItem>> {
        self.query().xpath(expr)
    }

    pub fn xpath_first(&self, expr: &str) -> Result<Option<XPathItem>> {
        Ok(self.query().xpath(expr)?.into_iter().next())
    }

    /// First template match in this element's visible text
    pub fn search(&self, template: &str) -> Result<Option<Captures>> {
        self.query().search(template)
    }

    /// Every template match in this element's visible text
    pub fn search_all(&self, template: &str) -> Result<Vec<Captures>> {
        self.query().search_all(template)
    }

    /// Hrefs of anchors in this subtree, as written
    pub fn links(&self) -> BTreeSet<String> {
        self.query().links()
    }

    /// Hrefs of anchors in this subtree resolved against the base URL;
    /// hrefs that do not resolve are dropped
    pub fn absolute_links(&self) -> BTreeSet<String> {
        self.query().absolute_links()
    }

    pub fn base_url(&self) -> Url {
        self.query().base_url()
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.tree, &other.tree) && self.node == other.node
    }
}

impl Eq for Element {}

impl Hash for Element {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.tree) as usize).hash(state);
        self.node.hash(state);
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Element '{}'", self.tag())?;
        if let Some(el) = self.tree.element(self.node) {
            let mut attrs: Vec<_> = el.value().attrs().collect();
            attrs.sort();
            for (k, v) in attrs {
                write!(f, " {}={:?}", k, v)?;
            }
        }
        write!(f, ">")
    }
}
