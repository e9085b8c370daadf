//! XML helpers on top of quick-xml.
//!
//! [`XmlWriter`] renders libvirt domain definitions and OVF descriptors;
//! [`parse_dom`] reads `virsh dumpxml` output into a small tree.

use crate::error::{Error, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::collections::HashMap;
use std::io::Cursor;

/// Incremental XML document builder.
pub struct XmlWriter {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl XmlWriter {
    /// Writer without indentation.
    pub fn new() -> Self {
        Self {
            writer: Writer::new(Cursor::new(Vec::new())),
        }
    }

    /// Writer that indents nested elements by `width` spaces.
    pub fn indented(width: usize) -> Self {
        Self {
            writer: Writer::new_with_indent(Cursor::new(Vec::new()), b' ', width),
        }
    }

    /// Emit `<?xml version="1.0" encoding="UTF-8"?>`.
    pub fn declaration(&mut self) -> Result<()> {
        self.write(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
    }

    /// Open an element.
    pub fn start_element(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<()> {
        let mut elem = BytesStart::new(name);
        for (key, value) in attributes {
            elem.push_attribute((*key, *value));
        }
        self.write(Event::Start(elem))
    }

    /// `<name>text</name>`.
    pub fn text_element(&mut self, name: &str, text: &str) -> Result<()> {
        self.text_element_with_attrs(name, text, &[])
    }

    /// `<name attrs...>text</name>`.
    pub fn text_element_with_attrs(
        &mut self,
        name: &str,
        text: &str,
        attributes: &[(&str, &str)],
    ) -> Result<()> {
        self.start_element(name, attributes)?;
        if !text.is_empty() {
            self.write(Event::Text(BytesText::new(text)))?;
        }
        self.end_element(name)
    }

    /// `<name attrs.../>`.
    pub fn empty_element(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<()> {
        let mut elem = BytesStart::new(name);
        for (key, value) in attributes {
            elem.push_attribute((*key, *value));
        }
        self.write(Event::Empty(elem))
    }

    /// Close an element.
    pub fn end_element(&mut self, name: &str) -> Result<()> {
        self.write(Event::End(BytesEnd::new(name)))
    }

    /// The rendered document.
    pub fn into_string(self) -> Result<String> {
        let bytes = self.writer.into_inner().into_inner();
        String::from_utf8(bytes).map_err(|e| Error::Xml(e.to_string()))
    }

    fn write(&mut self, event: Event<'_>) -> Result<()> {
        self.writer
            .write_event(event)
            .map_err(|e| Error::Xml(format!("failed to write xml: {}", e)))
    }
}

impl Default for XmlWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Element of a parsed document.
#[derive(Debug, Clone, Default)]
pub struct XmlNode {
    /// Qualified element name.
    pub name: String,
    /// Attributes by qualified name.
    pub attributes: HashMap<String, String>,
    /// Concatenated, unescaped text content.
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// First element named `name`, depth first, including `self`.
    pub fn find(&self, name: &str) -> Option<&XmlNode> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Direct children named `name`.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First direct child named `name`.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Attribute value.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Parse a document into an [`XmlNode`] tree rooted at the document element.
pub fn parse_dom(xml: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(node_from(&e)),
            Ok(Event::Empty(e)) => {
                let node = node_from(&e);
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Ok(Event::End(_)) => {
                if let Some(done) = stack.pop() {
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(done),
                        None => root = Some(done),
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(|e| Error::Xml(e.to_string()))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::Xml(format!(
                    "parse error at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(Error::Xml("unexpected end of document".to_string()));
    }
    root.ok_or_else(|| Error::Xml("no root element".to_string()))
}

fn node_from(start: &BytesStart<'_>) -> XmlNode {
    let mut attributes = HashMap::new();
    for attr in start.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
        attributes.insert(key, value);
    }
    XmlNode {
        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
        attributes,
        text: String::new(),
        children: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_escapes_and_nests() {
        let mut w = XmlWriter::new();
        w.start_element("domain", &[("type", "kvm")]).unwrap();
        w.text_element("name", "a<b").unwrap();
        w.text_element_with_attrs("memory", "2048", &[("unit", "MiB")]).unwrap();
        w.empty_element("disk", &[("type", "file")]).unwrap();
        w.end_element("domain").unwrap();
        let xml = w.into_string().unwrap();

        assert!(xml.contains("<name>a&lt;b</name>"));
        assert!(xml.contains("<memory unit=\"MiB\">2048</memory>"));
        assert!(xml.contains("<disk type=\"file\"/>"));

        let dom = parse_dom(&xml).unwrap();
        assert_eq!(dom.attr("type"), Some("kvm"));
        assert_eq!(dom.child("name").map(|n| n.text.as_str()), Some("a<b"));
    }

    #[test]
    fn test_parse_nested_and_namespaced() {
        let xml = r#"<?xml version="1.0"?>
            <ovf:Envelope xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1">
              <ovf:DiskSection>
                <ovf:Disk ovf:capacity="2" ovf:diskId="vmdisk1"/>
              </ovf:DiskSection>
            </ovf:Envelope>"#;
        let dom = parse_dom(xml).unwrap();
        assert_eq!(dom.name, "ovf:Envelope");
        let disk = dom.find("ovf:Disk").unwrap();
        assert_eq!(disk.attr("ovf:capacity"), Some("2"));
    }

    #[test]
    fn test_parse_rejects_truncated_document() {
        assert!(parse_dom("<domain><name>x</name>").is_err());
        assert!(parse_dom("").is_err());
    }
}
