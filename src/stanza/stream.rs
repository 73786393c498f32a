/// Non-stanza stream elements: features, STARTTLS and SASL exchanges,
/// and stream-level errors. Base64 decoding happens here, at the stanza
/// boundary; mechanism payloads travel as raw bytes everywhere else.
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use crate::error::Result;
use crate::xml::{namespaces, Element};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFeatures {
    pub mechanisms: Vec<String>,
    pub starttls: bool,
    pub starttls_required: bool,
    pub bind: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamElement {
    Features(StreamFeatures),
    TlsProceed,
    TlsFailure,
    SaslChallenge(Vec<u8>),
    SaslSuccess(Option<Vec<u8>>),
    SaslFailure {
        condition: String,
        text: Option<String>,
    },
    StreamError {
        condition: String,
        text: Option<String>,
    },
}

impl StreamElement {
    /// Routes a decoded top-level element: `Some` for the fixed
    /// stream-level vocabulary, `None` for anything else (stanzas,
    /// unknown extensions).
    pub fn classify(element: &Element) -> Result<Option<StreamElement>> {
        let classified = match (element.name.as_str(), element.namespace.as_str()) {
            ("features", namespaces::STREAMS) => {
                StreamElement::Features(parse_features(element))
            }
            ("error", namespaces::STREAMS) => {
                let (condition, text) = parse_condition(element, namespaces::STREAM_ERRORS);
                StreamElement::StreamError { condition, text }
            }
            ("proceed", namespaces::TLS) => StreamElement::TlsProceed,
            ("failure", namespaces::TLS) => StreamElement::TlsFailure,
            ("challenge", namespaces::SASL) => {
                StreamElement::SaslChallenge(decode_payload(&element.text())?)
            }
            ("success", namespaces::SASL) => {
                let text = element.text();
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    StreamElement::SaslSuccess(None)
                } else {
                    StreamElement::SaslSuccess(Some(decode_payload(trimmed)?))
                }
            }
            ("failure", namespaces::SASL) => {
                let (condition, text) = parse_condition(element, namespaces::SASL);
                StreamElement::SaslFailure { condition, text }
            }
            _ => return Ok(None),
        };
        Ok(Some(classified))
    }
}

fn parse_features(element: &Element) -> StreamFeatures {
    let mut features = StreamFeatures::default();
    for child in element.child_elements() {
        match (child.name.as_str(), child.namespace.as_str()) {
            ("starttls", namespaces::TLS) => {
                features.starttls = true;
                features.starttls_required = child.child_named("required").is_some();
            }
            ("mechanisms", namespaces::SASL) => {
                for mech in child.child_elements() {
                    if mech.name == "mechanism" {
                        features.mechanisms.push(mech.text().trim().to_string());
                    }
                }
            }
            ("bind", namespaces::BIND) => features.bind = true,
            _ => {}
        }
    }
    features
}

/// Extracts `(defined-condition, text)` from an error-shaped element whose
/// condition children live in `condition_ns`.
fn parse_condition(element: &Element, condition_ns: &str) -> (String, Option<String>) {
    let mut condition = String::new();
    let mut text = None;
    for child in element.child_elements() {
        if child.namespace != condition_ns {
            continue;
        }
        if child.name == "text" {
            text = Some(child.text());
        } else if condition.is_empty() {
            condition = child.name.clone();
        }
    }
    (condition, text)
}

/// SASL payload decoding: `=` is the empty-response sentinel.
fn decode_payload(text: &str) -> Result<Vec<u8>> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "=" {
        return Ok(Vec::new());
    }
    Ok(B64.decode(trimmed)?)
}

/// SASL payload encoding for the wire; empty bytes become `=`.
fn encode_payload(payload: &[u8]) -> String {
    if payload.is_empty() {
        "=".to_string()
    } else {
        B64.encode(payload)
    }
}

// ── client→server builders ───────────────────────────────

pub fn starttls_request() -> Element {
    Element::new("starttls", namespaces::TLS)
}

pub fn auth(mechanism: &str, initial: Option<&[u8]>) -> Element {
    let el = Element::new("auth", namespaces::SASL).with_attr("mechanism", mechanism);
    match initial {
        Some(payload) => el.with_text(encode_payload(payload)),
        None => el,
    }
}

pub fn response(payload: &[u8]) -> Element {
    Element::new("response", namespaces::SASL).with_text(encode_payload(payload))
}

/// The client's `<stream:stream>` open tag. Not an [`Element`]: the root
/// stays open for the lifetime of the stream, so only its opening tag is
/// ever written.
pub fn stream_header(service_domain: &str, language: Option<&str>) -> String {
    let mut header = String::from(
        "<?xml version='1.0'?>\
         <stream:stream \
         xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' ",
    );
    if let Some(lang) = language {
        header.push_str(&format!("xml:lang='{lang}' "));
    }
    header.push_str(&format!("to='{service_domain}' version='1.0'>"));
    header
}

pub fn stream_close() -> &'static str {
    "</stream:stream>"
}
