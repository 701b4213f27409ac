//! HTML document queries for site resolvers
//!
//! `scraper::Html` is not `Send`, so documents are parsed and queried inside
//! these synchronous helpers and only owned `Node` copies cross an `.await`.

use std::collections::HashMap;

use scraper::{ElementRef, Html, Selector};

use crate::ripper::error::{RipperError, RipperResult};

/// Owned copy of a matched element
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub text: String,
    attrs: HashMap<String, String>,
}

impl Node {
    fn from_element(element: ElementRef<'_>) -> Self {
        let text = element.text().collect::<String>().trim().to_string();
        let attrs = element
            .value()
            .attrs()
            .map(|(name, value)| (name.to_string(), value.trim().to_string()))
            .collect();
        Self { text, attrs }
    }

    /// Attribute value, `None` when absent or blank
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Attribute value or an extraction error naming what was expected
    pub fn require_attr(&self, name: &str, page: &str) -> RipperResult<&str> {
        self.attr(name).ok_or_else(|| {
            RipperError::Extraction(format!("attribute '{}' missing on node in {}", name, page))
        })
    }

    /// Trimmed text content, `None` when blank
    pub fn non_empty_text(&self) -> Option<&str> {
        Some(self.text.as_str()).filter(|text| !text.is_empty())
    }
}

fn parse_selector(css: &str) -> RipperResult<Selector> {
    Selector::parse(css).map_err(|e| RipperError::Extraction(format!("invalid selector '{}': {:?}", css, e)))
}

/// First element matching `css`, if any
pub fn select_first(html: &str, css: &str) -> RipperResult<Option<Node>> {
    let selector = parse_selector(css)?;
    let document = Html::parse_document(html);
    let node = document.select(&selector).next().map(Node::from_element);
    Ok(node)
}

/// Every element matching `css`, in document order
pub fn select_all(html: &str, css: &str) -> RipperResult<Vec<Node>> {
    let selector = parse_selector(css)?;
    let document = Html::parse_document(html);
    let nodes = document.select(&selector).map(Node::from_element).collect();
    Ok(nodes)
}

/// First element matching `css`, or an extraction error naming the page
pub fn require_first(html: &str, css: &str, page: &str) -> RipperResult<Node> {
    select_first(html, css)?.ok_or_else(|| {
        RipperError::Extraction(format!("selector '{}' cannot be found in '{}'", css, page))
    })
}

/// Trimmed text runs under the first element matching `css`, in document
/// order, up to the first link or image. `None` when nothing matches.
pub fn leading_texts(html: &str, css: &str) -> RipperResult<Option<Vec<String>>> {
    let selector = parse_selector(css)?;
    let document = Html::parse_document(html);
    let Some(root) = document.select(&selector).next() else {
        return Ok(None);
    };
    let mut texts = Vec::new();
    for node in root.descendants() {
        match node.value() {
            scraper::Node::Element(element) if matches!(element.name(), "a" | "img") => break,
            scraper::Node::Text(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    texts.push(text.to_string());
                }
            }
            _ => {}
        }
    }
    Ok(Some(texts))
}

/// File name derived from the last path segment of `url`
pub fn default_image_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or("image")
        .to_string()
}
