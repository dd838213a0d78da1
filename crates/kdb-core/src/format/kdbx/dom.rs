//! A minimal element tree over xml-rs events.
//!
//! The KDBX document is walked in document order after parsing, which keeps
//! the inner stream in step with the protected values.

use crate::error::{Error, Result};
use xml::reader::{EventReader, ParserConfig, XmlEvent};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Node>,
}

impl Node {
    /// Parse a document and return its root element
    pub fn parse(xml: &[u8]) -> Result<Node> {
        let config = ParserConfig::new()
            .trim_whitespace(false)
            .whitespace_to_characters(true)
            .cdata_to_characters(true)
            .ignore_comments(true);
        let reader = EventReader::new_with_config(xml, config);

        let mut stack: Vec<Node> = Vec::new();
        let mut root = None;
        for event in reader {
            match event? {
                XmlEvent::StartElement {
                    name, attributes, ..
                } => stack.push(Node {
                    name: name.local_name,
                    attrs: attributes
                        .into_iter()
                        .map(|a| (a.name.local_name, a.value))
                        .collect(),
                    ..Node::default()
                }),
                XmlEvent::Characters(text) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text);
                    }
                }
                XmlEvent::EndElement { .. } => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| Error::Xml("Unbalanced end element".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root = Some(node),
                    }
                }
                _ => {}
            }
        }
        root.ok_or_else(|| Error::Xml("Document has no root element".to_string()))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of a child element, if present
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }
}
