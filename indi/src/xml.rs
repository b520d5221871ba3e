//! Minimal XML element tree
//!
//! INDI frames and driver descriptor files are small, self-contained
//! documents. They are read into an owned tree with `quick-xml` so the
//! handlers can walk attributes and children without tracking parser state.

use crate::error::{IndiError, IndiResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// One parsed XML element with its attributes, text and children
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    /// Concatenated, trimmed text content directly inside this element
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    /// Parse the first complete element in `input`.
    ///
    /// Declarations, comments and processing instructions are ignored.
    /// Anything after the root element closes is not read.
    pub fn parse(input: &str) -> IndiResult<XmlElement> {
        let mut reader = Reader::from_str(input);
        reader.trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();

        loop {
            let event = reader.read_event().map_err(|e| {
                IndiError::ParseError(format!(
                    "{} at byte {}",
                    e,
                    reader.buffer_position()
                ))
            })?;

            match event {
                Event::Start(start) => {
                    stack.push(element_from_start(&start)?);
                }
                Event::Empty(start) => {
                    let element = element_from_start(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        let value = text
                            .unescape()
                            .map_err(|e| IndiError::ParseError(e.to_string()))?;
                        current.text.push_str(&value);
                    }
                }
                Event::CData(data) => {
                    if let Some(current) = stack.last_mut() {
                        current
                            .text
                            .push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        IndiError::ParseError("closing tag without opening tag".to_string())
                    })?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Event::Eof => {
                    return Err(IndiError::ParseError(match stack.last() {
                        Some(open) => format!("unexpected end of input inside <{}>", open.name),
                        None => "no root element".to_string(),
                    }));
                }
                _ => {}
            }
        }
    }

    /// Attribute value by name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First child with the given tag name
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given tag name, in document order
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of the first child with the given tag name
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }
}

fn element_from_start(start: &BytesStart) -> IndiResult<XmlElement> {
    let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| IndiError::ParseError(format!("<{}>: {}", name, e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| IndiError::ParseError(format!("<{}>: {}", name, e)))?
            .to_string();
        attributes.push((key, value));
    }
    Ok(XmlElement {
        name,
        attributes,
        text: String::new(),
        children: Vec::new(),
    })
}
