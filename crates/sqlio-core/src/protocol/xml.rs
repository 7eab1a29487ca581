//! Owned XML element tree for tag-delimited device messages.
//!
//! Tag-delimited devices (the SC500 family) wrap every message in a
//! `<msg ...>...</msg>` element.  The framer parses each message into an
//! [`XmlElement`] so pipeline handlers can inspect attributes and text without
//! re-parsing.  The tree is deliberately small: elements, attributes, and text.
//! Comments, processing instructions, and the XML declaration are accepted
//! and discarded.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// Errors produced while parsing an XML message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum XmlError {
    /// The tokenizer rejected the input.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// The input contained no element at all.
    #[error("document has no root element")]
    NoRoot,

    /// A second top-level element followed the root.
    #[error("document has more than one root element")]
    MultipleRoots,

    /// Non-whitespace text appeared outside the root element.
    #[error("text outside of the root element")]
    TextOutsideRoot,

    /// The input ended while an element was still open.
    #[error("element <{0}> is not closed")]
    Unclosed(String),
}

/// A child of an [`XmlElement`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

/// An XML element with its attributes and children, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    /// Parses a complete document and returns its root element.
    ///
    /// # Errors
    ///
    /// Returns [`XmlError`] when the document is not well formed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use sqlio_core::XmlElement;
    ///
    /// let msg = XmlElement::parse(r#"<msg id="1">payload</msg>"#).unwrap();
    /// assert_eq!(msg.name, "msg");
    /// assert_eq!(msg.attribute("id"), Some("1"));
    /// assert_eq!(msg.text(), "payload");
    /// ```
    pub fn parse(text: &str) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut open: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| XmlError::Syntax(e.to_string()))?;
            match event {
                Event::Start(start) => {
                    if open.is_empty() && root.is_some() {
                        return Err(XmlError::MultipleRoots);
                    }
                    open.push(element_from(&start)?);
                }
                Event::Empty(start) => {
                    let element = element_from(&start)?;
                    attach(&mut open, &mut root, element)?;
                }
                Event::End(_) => {
                    // quick-xml verifies that end names match their start tags.
                    let element = open
                        .pop()
                        .ok_or_else(|| XmlError::Syntax("unexpected end tag".to_string()))?;
                    attach(&mut open, &mut root, element)?;
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| XmlError::Syntax(e.to_string()))?;
                    push_text(&mut open, &text)?;
                }
                Event::CData(data) => {
                    let text = String::from_utf8(data.into_inner().into_owned())
                        .map_err(|e| XmlError::Syntax(e.to_string()))?;
                    push_text(&mut open, &text)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(unclosed) = open.pop() {
            return Err(XmlError::Unclosed(unclosed.name));
        }
        root.ok_or(XmlError::NoRoot)
    }

    /// Returns the value of the attribute called `name`.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Returns the first child element called `name`.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|element| element.name == name)
    }

    /// Iterates over the child elements, skipping text nodes.
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(element) => Some(element),
            XmlNode::Text(_) => None,
        })
    }

    /// Concatenated text of this element and all of its descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }
}

fn collect_text(element: &XmlElement, out: &mut String) {
    for node in &element.children {
        match node {
            XmlNode::Text(text) => out.push_str(text),
            XmlNode::Element(child) => collect_text(child, out),
        }
    }
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement, XmlError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    // Devices emit unquoted values such as `<msg id=1>`.
    for attr in start.html_attributes() {
        let attr = attr.map_err(|e| XmlError::Syntax(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError::Syntax(e.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(XmlElement {
        name,
        attributes,
        children: Vec::new(),
    })
}

fn attach(
    open: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), XmlError> {
    match open.last_mut() {
        Some(parent) => {
            parent.children.push(XmlNode::Element(element));
            Ok(())
        }
        None if root.is_some() => Err(XmlError::MultipleRoots),
        None => {
            *root = Some(element);
            Ok(())
        }
    }
}

fn push_text(open: &mut [XmlElement], text: &str) -> Result<(), XmlError> {
    match open.last_mut() {
        Some(parent) => {
            if !text.is_empty() {
                parent.children.push(XmlNode::Text(text.to_string()));
            }
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(XmlError::TextOutsideRoot),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
