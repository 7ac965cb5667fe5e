//! XPath queries over the `scraper` tree.
//!
//! Expressions are compiled and evaluated by `sxd-xpath`. The scraper tree is
//! mirrored into an `sxd-document` for each evaluation, and element hits are
//! mapped back to their scraper `NodeId`, so an element reached through XPath
//! compares equal to the same element reached through a CSS selector.

use crate::{Error, Result};
use ego_tree::{NodeId, NodeRef, Tree};
use scraper::Node;
use std::collections::HashMap;
use std::fmt;
use sxd_document::{dom, Package};
use sxd_xpath::nodeset::Node as XNode;
use sxd_xpath::{Context, Factory, Value};

/// One result of an XPath query
#[derive(Debug, Clone, PartialEq)]
pub enum Selected {
    /// An element node
    Node(NodeId),
    /// A string result: attribute value, text node, or a computed scalar
    Value(String),
}

fn syntax(expr: &str, msg: impl fmt::Display) -> Error {
    Error::Selector(format!("{:?}: {}", expr, msg))
}

/// A compiled XPath expression, reusable across trees
pub struct XPath {
    source: String,
    compiled: sxd_xpath::XPath,
}

impl fmt::Debug for XPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("XPath").field(&self.source).finish()
    }
}

impl XPath {
    /// Compile an XPath 1.0 expression
    pub fn parse(src: &str) -> Result<Self> {
        let compiled = Factory::new()
            .build(src)
            .map_err(|e| syntax(src, e))?
            .ok_or_else(|| syntax(src, "empty expression"))?;
        Ok(Self { source: src.to_string(), compiled })
    }

    /// The expression as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate with `context` as the context node. Node-set results come back
    /// in document order without duplicates; scalar results come back as a
    /// single `Selected::Value`.
    pub fn evaluate(&self, tree: &Tree<Node>, context: NodeId) -> Result<Vec<Selected>> {
        let package = Package::new();
        let doc = package.as_document();
        let mirror = Mirror::build(&doc, tree);

        let start = if context == tree.root().id() {
            XNode::Root(doc.root())
        } else {
            match mirror.to_sxd.get(&context) {
                Some(el) => XNode::Element(*el),
                None => return Ok(Vec::new()),
            }
        };

        let value = self
            .compiled
            .evaluate(&Context::new(), start)
            .map_err(|e| syntax(&self.source, e))?;
        Ok(match value {
            Value::Nodeset(nodes) => nodes
                .document_order()
                .into_iter()
                .filter_map(|n| mirror.selected(n))
                .collect(),
            Value::Boolean(b) => vec![Selected::Value(b.to_string())],
            Value::Number(n) => vec![Selected::Value(format_number(n))],
            Value::String(s) => vec![Selected::Value(s)],
        })
    }
}

/// The scraper tree rebuilt as an sxd document, with element maps both ways
struct Mirror<'d> {
    to_sxd: HashMap<NodeId, dom::Element<'d>>,
    to_scraper: HashMap<XNode<'d>, NodeId>,
}

enum Parent<'d> {
    Root(dom::Root<'d>),
    Element(dom::Element<'d>),
}

impl<'d> Mirror<'d> {
    fn build(doc: &dom::Document<'d>, tree: &Tree<Node>) -> Self {
        let mut mirror = Mirror { to_sxd: HashMap::new(), to_scraper: HashMap::new() };

        let mut stack: Vec<(NodeRef<'_, Node>, Parent<'d>)> = tree
            .root()
            .children()
            .rev()
            .map(|child| (child, Parent::Root(doc.root())))
            .collect();

        while let Some((node, parent)) = stack.pop() {
            match node.value() {
                Node::Element(el) => {
                    let created = doc.create_element(el.name());
                    for (name, value) in el.attrs() {
                        created.set_attribute_value(name, value);
                    }
                    match parent {
                        Parent::Root(root) => {
                            root.append_child(created);
                        }
                        Parent::Element(p) => {
                            p.append_child(created);
                        }
                    }
                    mirror.to_sxd.insert(node.id(), created);
                    mirror.to_scraper.insert(XNode::Element(created), node.id());
                    for child in node.children().rev() {
                        stack.push((child, Parent::Element(created)));
                    }
                }
                Node::Text(text) => {
                    if let Parent::Element(p) = parent {
                        p.append_child(doc.create_text(&text[..]));
                    }
                }
                Node::Comment(comment) => {
                    let created = doc.create_comment(&comment[..]);
                    match parent {
                        Parent::Root(root) => {
                            root.append_child(created);
                        }
                        Parent::Element(p) => {
                            p.append_child(created);
                        }
                    }
                }
                _ => {}
            }
        }
        mirror
    }

    fn selected(&self, node: XNode<'d>) -> Option<Selected> {
        match node {
            XNode::Element(_) => self.to_scraper.get(&node).map(|id| Selected::Node(*id)),
            XNode::Attribute(_) | XNode::Text(_) | XNode::Comment(_) => {
                Some(Selected::Value(node.string_value()))
            }
            _ => None,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}
