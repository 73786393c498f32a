/// Incremental framer for the server→client half of an XMPP stream.
///
/// Feed raw bytes with [`StreamFramer::push`], then drain complete protocol
/// elements with [`StreamFramer::next_frame`]. The `<stream:stream>` root
/// open tag is recognized and consumed (its namespace declarations are kept
/// for resolving prefixed siblings like `stream:features`); every completed
/// top-level child is returned as a generic [`Element`]. Partial subtrees
/// stay buffered until more bytes arrive.
///
/// DTDs and processing instructions are rejected outright, and entity
/// expansion is limited to the predefined set plus character references,
/// so no external entity can ever be fetched.
use std::collections::HashMap;

use quick_xml::errors::IllFormedError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;

use crate::error::{Error, Result};
use crate::xml::{namespaces, Element, Node};

/// Attributes of the server's `<stream:stream>` open tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamHeader {
    pub from: Option<String>,
    pub to: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum Frame {
    /// The stream root open tag. Emitted once per stream (again after
    /// a framer reset following TLS or SASL restart).
    StreamHeader(StreamHeader),
    /// A complete top-level child of the stream.
    Element(Element),
    /// The server closed its half of the stream with `</stream:stream>`.
    StreamEnd,
}

pub struct StreamFramer {
    buf: Vec<u8>,
    saw_header: bool,
    /// Default namespace declared on the stream root (`jabber:client`).
    default_ns: String,
    /// Prefix bindings declared on the stream root, e.g. `stream` →
    /// `http://etherx.jabber.org/streams`. Children are parsed after the
    /// root tag has been consumed, so the reader cannot see these itself.
    prefixes: HashMap<Vec<u8>, String>,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            saw_header: false,
            default_ns: namespaces::CLIENT.to_string(),
            prefixes: HashMap::new(),
        }
    }

    /// Rebinds the framer for a fresh stream. Required after a successful
    /// TLS upgrade and after SASL success, when the server starts a new
    /// XML document with its own `<stream:stream>` root.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.saw_header = false;
        self.default_ns = namespaces::CLIENT.to_string();
        self.prefixes.clear();
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode the next complete frame from the buffered bytes.
    /// Returns `Ok(None)` when more input is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            // The buffer moves out for the duration of one scan; the scan
            // itself only touches the namespace bookkeeping.
            let buf = std::mem::take(&mut self.buf);
            // Parse over the longest valid UTF-8 prefix; a chunk boundary
            // may split a multi-byte character.
            let scanned = match std::str::from_utf8(&buf) {
                Ok(text) => self.scan(text),
                Err(e) if e.error_len().is_none() => {
                    let text =
                        std::str::from_utf8(&buf[..e.valid_up_to()]).expect("validated prefix");
                    self.scan(text)
                }
                Err(e) => Err(Error::Parse(format!("invalid UTF-8 on stream: {e}"))),
            };
            self.buf = buf;

            match scanned? {
                Scan::NeedMore => return Ok(None),
                Scan::Skipped(consumed) => {
                    self.commit(consumed);
                }
                Scan::Header(header, consumed) => {
                    self.commit(consumed);
                    self.saw_header = true;
                    return Ok(Some(Frame::StreamHeader(header)));
                }
                Scan::Child(element, consumed) => {
                    self.commit(consumed);
                    return Ok(Some(Frame::Element(element)));
                }
                Scan::End(consumed) => {
                    self.commit(consumed);
                    return Ok(Some(Frame::StreamEnd));
                }
            }
        }
    }

    fn commit(&mut self, consumed: usize) {
        self.buf.drain(..consumed);
    }

    /// One parse attempt over the buffered text. Returns what was found
    /// together with the number of bytes it consumed.
    fn scan(&mut self, text: &str) -> Result<Scan> {
        let mut reader = NsReader::from_str(text);
        let mut stack: Vec<Element> = Vec::new();

        loop {
            let event = match reader.read_resolved_event() {
                Ok(ev) => ev,
                // Truncated markup at the end of the buffer: wait for more.
                Err(quick_xml::Error::Syntax(_)) => return Ok(Scan::NeedMore),
                // The root's end tag has no start tag inside this parse
                // window; a bare `</stream:stream>` is the server closing
                // its half of the stream.
                Err(quick_xml::Error::IllFormed(IllFormedError::UnmatchedEndTag(_)))
                    if stack.is_empty() && self.saw_header =>
                {
                    return Ok(Scan::End(reader.buffer_position() as usize));
                }
                Err(e) => return Err(Error::Parse(e.to_string())),
            };

            match event {
                (_, Event::Eof) => return Ok(Scan::NeedMore),

                (_, Event::Decl(_)) if stack.is_empty() && !self.saw_header => {
                    // `<?xml version='1.0'?>` before the stream root.
                }

                (_, Event::DocType(_)) => {
                    return Err(Error::Parse("DOCTYPE is not allowed on an XMPP stream".into()));
                }
                (_, Event::PI(_)) | (_, Event::Decl(_)) => {
                    return Err(Error::Parse(
                        "processing instruction is not allowed on an XMPP stream".into(),
                    ));
                }

                (resolve, Event::Start(start)) => {
                    if stack.is_empty() && !self.saw_header {
                        let header = self.read_stream_root(resolve, &start)?;
                        return Ok(Scan::Header(header, reader.buffer_position() as usize));
                    }
                    let element = self.build_element(resolve, &start)?;
                    stack.push(element);
                }

                (resolve, Event::Empty(start)) => {
                    if stack.is_empty() && !self.saw_header {
                        return Err(Error::Parse("stream root cannot be self-closing".into()));
                    }
                    let element = self.build_element(resolve, &start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => return Ok(Scan::Child(element, reader.buffer_position() as usize)),
                    }
                }

                (_, Event::End(_)) => match stack.pop() {
                    // An end tag below our own stack is the stream root
                    // closing: the server ended its half of the stream.
                    None => return Ok(Scan::End(reader.buffer_position() as usize)),
                    Some(done) => match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(done)),
                        None => return Ok(Scan::Child(done, reader.buffer_position() as usize)),
                    },
                },

                (_, Event::Text(t)) => {
                    let decoded = match t.unescape() {
                        Ok(s) => s,
                        // An entity split across chunks looks like a bad
                        // escape until the rest arrives.
                        Err(_) if reader.buffer_position() as usize >= text.len() => {
                            return Ok(Scan::NeedMore)
                        }
                        Err(e) => return Err(Error::Parse(e.to_string())),
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Text(decoded.into_owned())),
                        None => {
                            // Whitespace between stanzas is a keep-alive.
                            if !decoded.trim().is_empty() {
                                return Err(Error::Parse(
                                    "unexpected character data between stanzas".into(),
                                ));
                            }
                            return Ok(Scan::Skipped(reader.buffer_position() as usize));
                        }
                    }
                }

                (_, Event::CData(t)) => {
                    let decoded = String::from_utf8(t.into_inner().into_owned())
                        .map_err(|e| Error::Parse(e.to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Text(decoded)),
                        None => {
                            return Err(Error::Parse("unexpected CDATA between stanzas".into()))
                        }
                    }
                }

                (_, Event::Comment(_)) => {
                    if stack.is_empty() {
                        return Ok(Scan::Skipped(reader.buffer_position() as usize));
                    }
                }
            }
        }
    }

    /// Consumes the `<stream:stream>` open tag: validates its name, keeps
    /// its namespace declarations, and extracts the header attributes.
    fn read_stream_root(
        &mut self,
        resolve: ResolveResult,
        start: &BytesStart,
    ) -> Result<StreamHeader> {
        let local = start.local_name();
        if local.as_ref() != b"stream" {
            return Err(Error::Parse(format!(
                "expected stream root, got <{}>",
                String::from_utf8_lossy(start.name().as_ref())
            )));
        }
        if let ResolveResult::Bound(ns) = resolve {
            if ns.into_inner() != namespaces::STREAMS.as_bytes() {
                return Err(Error::Parse(format!(
                    "stream root in unexpected namespace {}",
                    String::from_utf8_lossy(ns.into_inner())
                )));
            }
        }

        let mut header = StreamHeader::default();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| Error::Parse(e.to_string()))?;
            let key = attr.key.as_ref().to_vec();
            let value = attr
                .unescape_value()
                .map_err(|e| Error::Parse(e.to_string()))?
                .into_owned();
            match key.as_slice() {
                b"xmlns" => self.default_ns = value,
                k if k.starts_with(b"xmlns:") => {
                    self.prefixes.insert(k[6..].to_vec(), value);
                }
                b"from" => header.from = Some(value),
                b"to" => header.to = Some(value),
                b"id" => header.id = Some(value),
                b"version" => header.version = Some(value),
                b"xml:lang" => header.language = Some(value),
                _ => {}
            }
        }
        Ok(header)
    }

    /// Builds an [`Element`] shell (name, namespace, attributes) from a
    /// start tag; children are attached by the scan loop.
    fn build_element(&self, resolve: ResolveResult, start: &BytesStart) -> Result<Element> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let namespace = match resolve {
            ResolveResult::Bound(ns) => String::from_utf8_lossy(ns.into_inner()).into_owned(),
            // No declaration inside the parsed slice: inherit from the
            // stream root.
            ResolveResult::Unbound => self.default_ns.clone(),
            ResolveResult::Unknown(prefix) => match self.prefixes.get(&prefix) {
                Some(ns) => ns.clone(),
                None => {
                    return Err(Error::Parse(format!(
                        "undeclared namespace prefix {}",
                        String::from_utf8_lossy(&prefix)
                    )))
                }
            },
        };

        let mut element = Element::new(name, namespace);
        for attr in start.attributes() {
            let attr = attr.map_err(|e| Error::Parse(e.to_string()))?;
            let key = attr.key.as_ref();
            if key == b"xmlns" || key.starts_with(b"xmlns:") {
                continue;
            }
            let value = attr
                .unescape_value()
                .map_err(|e| Error::Parse(e.to_string()))?
                .into_owned();
            // Attribute prefixes other than xml: are not used by XMPP;
            // keep the qualified name as written.
            element
                .attributes
                .push((String::from_utf8_lossy(key).into_owned(), value));
        }
        Ok(element)
    }
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

enum Scan {
    /// The buffer holds no complete construct yet.
    NeedMore,
    /// Ignorable content (keep-alive whitespace, comment) was consumed.
    Skipped(usize),
    Header(StreamHeader, usize),
    Child(Element, usize),
    End(usize),
}
