//! Text templates for pulling fields out of flattened page text.
//!
//! A template mixes literal text with placeholders: `{name}` captures a named
//! field, `{}` captures a positional one and `{{` / `}}` stand for literal
//! braces. A placeholder followed by a literal captures the shortest
//! non-empty text up to that literal; a trailing placeholder runs to the end
//! of the line. Templates without any literal text never match.

use crate::{Error, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::ops::Index;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Field(Option<String>),
}

/// A compiled search template
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    fields: Vec<Option<String>>,
    regex: Option<Regex>,
}

/// Fields captured by one template match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captures {
    fixed: Vec<String>,
    named: BTreeMap<String, String>,
    span: (usize, usize),
}

impl Captures {
    /// Named field value
    pub fn get(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }

    /// Positional (`{}`) field values in template order
    pub fn fixed(&self) -> &[String] {
        &self.fixed
    }

    /// All named fields
    pub fn named(&self) -> &BTreeMap<String, String> {
        &self.named
    }

    /// Byte range of the whole match within the searched text
    pub fn span(&self) -> (usize, usize) {
        self.span
    }
}

impl Index<&str> for Captures {
    type Output = str;

    fn index(&self, name: &str) -> &str {
        match self.named.get(name) {
            Some(v) => v,
            None => panic!("no field named `{}` in match", name),
        }
    }
}

impl Index<usize> for Captures {
    type Output = str;

    fn index(&self, idx: usize) -> &str {
        &self.fixed[idx]
    }
}

fn tokenize(template: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) if ch.is_alphanumeric() || ch == '_' => name.push(ch),
                        Some(ch) => {
                            return Err(Error::Selector(format!(
                                "unexpected `{}` in placeholder of template {:?}",
                                ch, template
                            )))
                        }
                        None => {
                            return Err(Error::Selector(format!(
                                "unclosed placeholder in template {:?}",
                                template
                            )))
                        }
                    }
                }
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(Token::Field(if name.is_empty() { None } else { Some(name) }));
            }
            '}' => {
                return Err(Error::Selector(format!(
                    "single `}}` in template {:?}; use `}}}}` for a literal brace",
                    template
                )))
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

impl Template {
    /// Parse and compile a template
    pub fn parse(template: &str) -> Result<Self> {
        let tokens = tokenize(template)?;
        let mut fields = Vec::new();
        let mut pattern = String::new();
        let has_anchor = tokens.iter().any(|t| matches!(t, Token::Literal(_)));

        for (i, token) in tokens.iter().enumerate() {
            match token {
                Token::Literal(text) => pattern.push_str(&regex::escape(text)),
                Token::Field(name) => {
                    if let Some(n) = name {
                        if fields.iter().flatten().any(|f: &String| f == n) {
                            return Err(Error::Selector(format!(
                                "field `{}` appears twice in template {:?}",
                                n, template
                            )));
                        }
                    }
                    fields.push(name.clone());
                    let trailing = i + 1 == tokens.len();
                    pattern.push_str(if trailing { "(.+)" } else { "(.+?)" });
                }
            }
        }

        let regex = if has_anchor {
            Some(Regex::new(&pattern).map_err(|e| Error::Selector(e.to_string()))?)
        } else {
            None
        };

        Ok(Self { source: template.to_string(), fields, regex })
    }

    /// The template as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First match in `text`
    pub fn search(&self, text: &str) -> Option<Captures> {
        let regex = self.regex.as_ref()?;
        regex.captures(text).map(|caps| self.collect(&caps))
    }

    /// Every non-overlapping match in `text`, in order
    pub fn search_all(&self, text: &str) -> Vec<Captures> {
        match &self.regex {
            Some(regex) => regex.captures_iter(text).map(|caps| self.collect(&caps)).collect(),
            None => Vec::new(),
        }
    }

    fn collect(&self, caps: &regex::Captures<'_>) -> Captures {
        let mut out = Captures::default();
        if let Some(m) = caps.get(0) {
            out.span = (m.start(), m.end());
        }
        for (i, field) in self.fields.iter().enumerate() {
            let value = caps.get(i + 1).map(|m| m.as_str().to_string()).unwrap_or_default();
            match field {
                Some(name) => {
                    out.named.insert(name.clone(), value);
                }
                None => out.fixed.push(value),
            }
        }
        out
    }
}

/// Search `text` once with a template string
pub fn search(template: &str, text: &str) -> Result<Option<Captures>> {
    Ok(Template::parse(template)?.search(text))
}

/// Search `text` for every match of a template string
pub fn search_all(template: &str, text: &str) -> Result<Vec<Captures>> {
    Ok(Template::parse(template)?.search_all(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_field_between_anchors() {
        let caps = search("Price: {amount} USD", "Total Price: 42.50 USD today")
            .unwrap()
            .unwrap();
        assert_eq!(caps.get("amount"), Some("42.50"));
        assert_eq!(&caps["amount"], "42.50");
    }

    #[test]
    fn positional_fields_keep_order() {
        let caps = search("{} by {}!", "Dune by Herbert!").unwrap().unwrap();
        assert_eq!(caps.fixed(), &["Dune".to_string(), "Herbert".to_string()]);
        assert_eq!(&caps[1], "Herbert");
    }

    #[test]
    fn lazy_field_stops_at_first_anchor() {
        let caps = search("<{tag}>", "<a> and <b>").unwrap().unwrap();
        assert_eq!(caps.get("tag"), Some("a"));
    }

    #[test]
    fn trailing_field_runs_to_end_of_line() {
        let caps = search("Author: {name}", "Author: Frank Herbert\nYear: 1965")
            .unwrap()
            .unwrap();
        assert_eq!(caps.get("name"), Some("Frank Herbert"));
    }

    #[test]
    fn search_all_finds_every_occurrence() {
        let all = search_all("id={id};", "id=1; id=22; id=333;").unwrap();
        let ids: Vec<_> = all.iter().filter_map(|c| c.get("id")).collect();
        assert_eq!(ids, vec!["1", "22", "333"]);
    }

    #[test]
    fn missing_anchor_is_soft_failure() {
        assert!(search("Price: {p} EUR", "Price: 3 USD").unwrap().is_none());
        assert!(search_all("nothing {x} here", "unrelated").unwrap().is_empty());
    }

    #[test]
    fn placeholder_only_template_never_matches() {
        assert!(search("{a}{b}", "anything").unwrap().is_none());
        assert!(search("", "anything").unwrap().is_none());
    }

    #[test]
    fn escaped_braces_are_literals() {
        let caps = search("{{{key}}}", "set {color} now").unwrap().unwrap();
        assert_eq!(caps.get("key"), Some("color"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let caps = search("($ {v})", "cost ($ 9.99) each").unwrap().unwrap();
        assert_eq!(caps.get("v"), Some("9.99"));
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert!(matches!(Template::parse("oops {name"), Err(Error::Selector(_))));
        assert!(matches!(Template::parse("a } b"), Err(Error::Selector(_))));
        assert!(matches!(Template::parse("{x:d}"), Err(Error::Selector(_))));
        assert!(matches!(Template::parse("{x} and {x}"), Err(Error::Selector(_))));
    }
}
