/// Generic XML element tree and serializer.
///
/// Stanzas and extension elements that have no registered provider are kept
/// in this form: element name, namespace, attribute list in insertion order,
/// and ordered children. The serializer emits a deterministic byte string
/// with an `xmlns` declaration wherever an element's namespace differs from
/// its parent's.
pub mod framer;
pub mod namespaces;

use std::fmt;

/// A child of an element: either a nested element or character data.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Element {
    pub name: String,
    pub namespace: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    /// Sets an attribute, replacing any existing value for the same name
    /// while keeping the original insertion position.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Concatenated character data of the direct children.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            if let Node::Text(t) = child {
                out.push_str(t);
            }
        }
        out
    }

    /// First child element matching `(name, namespace)`.
    pub fn child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.child_elements()
            .find(|e| e.name == name && e.namespace == namespace)
    }

    /// First child element with the given local name, in any namespace.
    pub fn child_named(&self, name: &str) -> Option<&Element> {
        self.child_elements().find(|e| e.name == name)
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// Serializes the element assuming the surrounding default namespace is
    /// `jabber:client`, the context every top-level stanza is written in.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, namespaces::CLIENT);
        out
    }

    pub fn write_xml(&self, out: &mut String, parent_ns: &str) {
        out.push('<');
        out.push_str(&self.name);
        if self.namespace != parent_ns {
            out.push_str(" xmlns='");
            push_escaped_attr(out, &self.namespace);
            out.push('\'');
        }
        for (name, value) in &self.attributes {
            out.push(' ');
            out.push_str(name);
            out.push_str("='");
            push_escaped_attr(out, value);
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(e) => e.write_xml(out, &self.namespace),
                Node::Text(t) => push_escaped_text(out, t),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Equality ignores attribute order; everything else is structural.
impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        if self.name != other.name
            || self.namespace != other.namespace
            || self.attributes.len() != other.attributes.len()
            || self.children != other.children
        {
            return false;
        }
        self.attributes
            .iter()
            .all(|(n, v)| other.attr(n) == Some(v.as_str()))
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

fn push_escaped_text(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn push_escaped_attr(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── serialization ───────────────────────────────────

    #[test]
    fn test_empty_element_self_closes() {
        let el = Element::new("ping", namespaces::PING);
        assert_eq!(el.to_xml(), "<ping xmlns='urn:xmpp:ping'/>");
    }

    #[test]
    fn test_xmlns_omitted_when_parent_namespace_matches() {
        let el = Element::new("body", namespaces::CLIENT).with_text("hi");
        let mut out = String::new();
        el.write_xml(&mut out, namespaces::CLIENT);
        assert_eq!(out, "<body>hi</body>");
    }

    #[test]
    fn test_nested_namespace_declared_once() {
        let iq = Element::new("iq", namespaces::CLIENT)
            .with_attr("type", "set")
            .with_attr("id", "b1")
            .with_child(
                Element::new("bind", namespaces::BIND)
                    .with_child(Element::new("resource", namespaces::BIND).with_text("work")),
            );
        assert_eq!(
            iq.to_xml(),
            "<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>work</resource></bind></iq>"
        );
    }

    #[test]
    fn test_text_escaping() {
        let el = Element::new("body", namespaces::CLIENT).with_text("a < b & c > d");
        let mut out = String::new();
        el.write_xml(&mut out, namespaces::CLIENT);
        assert_eq!(out, "<body>a &lt; b &amp; c &gt; d</body>");
    }

    #[test]
    fn test_attr_escaping() {
        let el = Element::new("x", "ns").with_attr("v", "it's \"quoted\" & <odd>");
        assert_eq!(
            el.to_xml(),
            "<x xmlns='ns' v='it&apos;s &quot;quoted&quot; &amp; &lt;odd&gt;'/>"
        );
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let el = Element::new("message", namespaces::CLIENT)
            .with_attr("to", "a@b")
            .with_attr("type", "chat")
            .with_child(Element::new("body", namespaces::CLIENT).with_text("hello"));
        assert_eq!(el.to_xml(), el.to_xml());
    }

    // ── accessors ───────────────────────────────────────

    #[test]
    fn test_set_attr_replaces_in_place() {
        let mut el = Element::new("iq", namespaces::CLIENT)
            .with_attr("type", "get")
            .with_attr("id", "1");
        el.set_attr("type", "set");
        assert_eq!(el.attr("type"), Some("set"));
        assert_eq!(el.attributes[0].0, "type");
    }

    #[test]
    fn test_text_concatenates_nodes() {
        let mut el = Element::new("body", namespaces::CLIENT);
        el.children.push(Node::Text("a".into()));
        el.children.push(Node::Text("b".into()));
        assert_eq!(el.text(), "ab");
    }

    #[test]
    fn test_child_lookup_by_name_and_namespace() {
        let iq = Element::new("iq", namespaces::CLIENT)
            .with_child(Element::new("ping", namespaces::PING));
        assert!(iq.child("ping", namespaces::PING).is_some());
        assert!(iq.child("ping", namespaces::BIND).is_none());
    }

    // ── equality ────────────────────────────────────────

    #[test]
    fn test_equality_ignores_attribute_order() {
        let a = Element::new("iq", namespaces::CLIENT)
            .with_attr("type", "get")
            .with_attr("id", "1");
        let b = Element::new("iq", namespaces::CLIENT)
            .with_attr("id", "1")
            .with_attr("type", "get");
        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_respects_values() {
        let a = Element::new("iq", namespaces::CLIENT).with_attr("id", "1");
        let b = Element::new("iq", namespaces::CLIENT).with_attr("id", "2");
        assert_ne!(a, b);
    }
}
