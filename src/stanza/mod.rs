/// Typed stanzas: the closed sum of `iq`, `message`, and `presence`.
///
/// Every variant keeps the shared header fields (`id`, `from`, `to`) and an
/// ordered list of extension elements. Children with no dedicated field stay
/// as generic [`Element`]s so unknown extensions round-trip unharmed.
pub mod registry;
pub mod stream;

use crate::error::{Error, Result};
use crate::xml::{namespaces, Element};

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Iq(Iq),
    Message(Message),
    Presence(Presence),
}

impl Stanza {
    /// Decodes a top-level `jabber:client` element into a stanza.
    pub fn from_element(element: &Element) -> Result<Stanza> {
        match element.name.as_str() {
            "iq" => Ok(Stanza::Iq(Iq::from_element(element)?)),
            "message" => Ok(Stanza::Message(Message::from_element(element)?)),
            "presence" => Ok(Stanza::Presence(Presence::from_element(element)?)),
            other => Err(Error::Parse(format!("<{other}> is not a stanza"))),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Iq(iq) => Some(&iq.id),
            Stanza::Message(m) => m.id.as_deref(),
            Stanza::Presence(p) => p.id.as_deref(),
        }
    }

    pub fn from(&self) -> Option<&str> {
        match self {
            Stanza::Iq(iq) => iq.from.as_deref(),
            Stanza::Message(m) => m.from.as_deref(),
            Stanza::Presence(p) => p.from.as_deref(),
        }
    }

    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Iq(iq) => iq.to_element(),
            Stanza::Message(m) => m.to_element(),
            Stanza::Presence(p) => p.to_element(),
        }
    }

    pub fn to_xml(&self) -> String {
        self.to_element().to_xml()
    }
}

// ── IQ ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IqKind {
    Get,
    Set,
    Result,
    Error,
}

impl IqKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqKind::Get => "get",
            IqKind::Set => "set",
            IqKind::Result => "result",
            IqKind::Error => "error",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "get" => Ok(IqKind::Get),
            "set" => Ok(IqKind::Set),
            "result" => Ok(IqKind::Result),
            "error" => Ok(IqKind::Error),
            other => Err(Error::Parse(format!("unknown iq type '{other}'"))),
        }
    }

    /// `result` and `error` are terminal responses to a request id.
    pub fn is_response(&self) -> bool {
        matches!(self, IqKind::Result | IqKind::Error)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Iq {
    pub id: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub kind: IqKind,
    /// The single primary child, e.g. `<ping/>` or `<bind/>`.
    pub payload: Option<Element>,
    pub error: Option<StanzaError>,
}

impl Iq {
    pub fn get(payload: Element) -> Self {
        Self {
            id: new_id(),
            from: None,
            to: None,
            kind: IqKind::Get,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn set(payload: Element) -> Self {
        Self {
            kind: IqKind::Set,
            ..Self::get(payload)
        }
    }

    /// Empty `result` answering `request`: echoes the id, swaps from/to.
    pub fn result_for(request: &Iq) -> Self {
        Self {
            id: request.id.clone(),
            from: request.to.clone(),
            to: request.from.clone(),
            kind: IqKind::Result,
            payload: None,
            error: None,
        }
    }

    pub fn error_for(request: &Iq, error: StanzaError) -> Self {
        Self {
            error: Some(error),
            kind: IqKind::Error,
            ..Self::result_for(request)
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_payload(mut self, payload: Element) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn from_element(element: &Element) -> Result<Self> {
        let kind = IqKind::parse(
            element
                .attr("type")
                .ok_or_else(|| Error::Parse("iq without type attribute".into()))?,
        )?;
        let mut payload = None;
        let mut error = None;
        for child in element.child_elements() {
            if child.name == "error" && child.namespace == namespaces::CLIENT {
                error = Some(StanzaError::from_element(child));
            } else if payload.is_none() {
                payload = Some(child.clone());
            }
        }
        Ok(Self {
            id: element.attr("id").unwrap_or_default().to_string(),
            from: element.attr("from").map(String::from),
            to: element.attr("to").map(String::from),
            kind,
            payload,
            error,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("iq", namespaces::CLIENT).with_attr("type", self.kind.as_str());
        if !self.id.is_empty() {
            el.set_attr("id", &self.id);
        }
        if let Some(from) = &self.from {
            el.set_attr("from", from);
        }
        if let Some(to) = &self.to {
            el.set_attr("to", to);
        }
        if let Some(payload) = &self.payload {
            el = el.with_child(payload.clone());
        }
        if let Some(error) = &self.error {
            el = el.with_child(error.to_element());
        }
        el
    }
}

// ── Message ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind {
    Chat,
    Groupchat,
    Headline,
    #[default]
    Normal,
    Error,
}

impl MessageKind {
    fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Chat => "chat",
            MessageKind::Groupchat => "groupchat",
            MessageKind::Headline => "headline",
            MessageKind::Normal => "normal",
            MessageKind::Error => "error",
        }
    }

    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("chat") => MessageKind::Chat,
            Some("groupchat") => MessageKind::Groupchat,
            Some("headline") => MessageKind::Headline,
            Some("error") => MessageKind::Error,
            _ => MessageKind::Normal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub subject: Option<String>,
    pub thread: Option<String>,
    pub extensions: Vec<Element>,
}

impl Message {
    pub fn chat(to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Some(new_id()),
            to: Some(to.into()),
            kind: MessageKind::Chat,
            body: Some(body.into()),
            ..Self::default()
        }
    }

    pub fn from_element(element: &Element) -> Result<Self> {
        let mut message = Self {
            id: element.attr("id").map(String::from),
            from: element.attr("from").map(String::from),
            to: element.attr("to").map(String::from),
            kind: MessageKind::parse(element.attr("type")),
            ..Self::default()
        };
        for child in element.child_elements() {
            match (child.name.as_str(), child.namespace.as_str()) {
                ("body", namespaces::CLIENT) => message.body = Some(child.text()),
                ("subject", namespaces::CLIENT) => message.subject = Some(child.text()),
                ("thread", namespaces::CLIENT) => message.thread = Some(child.text()),
                _ => message.extensions.push(child.clone()),
            }
        }
        Ok(message)
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("message", namespaces::CLIENT);
        if self.kind != MessageKind::Normal {
            el.set_attr("type", self.kind.as_str());
        }
        if let Some(id) = &self.id {
            el.set_attr("id", id);
        }
        if let Some(from) = &self.from {
            el.set_attr("from", from);
        }
        if let Some(to) = &self.to {
            el.set_attr("to", to);
        }
        if let Some(subject) = &self.subject {
            el = el.with_child(Element::new("subject", namespaces::CLIENT).with_text(subject));
        }
        if let Some(body) = &self.body {
            el = el.with_child(Element::new("body", namespaces::CLIENT).with_text(body));
        }
        if let Some(thread) = &self.thread {
            el = el.with_child(Element::new("thread", namespaces::CLIENT).with_text(thread));
        }
        for ext in &self.extensions {
            el = el.with_child(ext.clone());
        }
        el
    }
}

// ── Presence ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceKind {
    /// No type attribute on the wire.
    #[default]
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceKind {
    fn as_str(&self) -> Option<&'static str> {
        match self {
            PresenceKind::Available => None,
            PresenceKind::Unavailable => Some("unavailable"),
            PresenceKind::Subscribe => Some("subscribe"),
            PresenceKind::Subscribed => Some("subscribed"),
            PresenceKind::Unsubscribe => Some("unsubscribe"),
            PresenceKind::Unsubscribed => Some("unsubscribed"),
            PresenceKind::Probe => Some("probe"),
            PresenceKind::Error => Some("error"),
        }
    }

    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("unavailable") => PresenceKind::Unavailable,
            Some("subscribe") => PresenceKind::Subscribe,
            Some("subscribed") => PresenceKind::Subscribed,
            Some("unsubscribe") => PresenceKind::Unsubscribe,
            Some("unsubscribed") => PresenceKind::Unsubscribed,
            Some("probe") => PresenceKind::Probe,
            Some("error") => PresenceKind::Error,
            _ => PresenceKind::Available,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Presence {
    pub id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub kind: PresenceKind,
    pub show: Option<String>,
    pub status: Option<String>,
    pub priority: Option<i8>,
    pub extensions: Vec<Element>,
}

impl Presence {
    /// The bare `<presence/>` announcing availability after bind.
    pub fn available() -> Self {
        Self::default()
    }

    pub fn from_element(element: &Element) -> Result<Self> {
        let mut presence = Self {
            id: element.attr("id").map(String::from),
            from: element.attr("from").map(String::from),
            to: element.attr("to").map(String::from),
            kind: PresenceKind::parse(element.attr("type")),
            ..Self::default()
        };
        for child in element.child_elements() {
            match (child.name.as_str(), child.namespace.as_str()) {
                ("show", namespaces::CLIENT) => presence.show = Some(child.text()),
                ("status", namespaces::CLIENT) => presence.status = Some(child.text()),
                ("priority", namespaces::CLIENT) => {
                    presence.priority = child.text().trim().parse().ok()
                }
                _ => presence.extensions.push(child.clone()),
            }
        }
        Ok(presence)
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("presence", namespaces::CLIENT);
        if let Some(kind) = self.kind.as_str() {
            el.set_attr("type", kind);
        }
        if let Some(id) = &self.id {
            el.set_attr("id", id);
        }
        if let Some(from) = &self.from {
            el.set_attr("from", from);
        }
        if let Some(to) = &self.to {
            el.set_attr("to", to);
        }
        if let Some(show) = &self.show {
            el = el.with_child(Element::new("show", namespaces::CLIENT).with_text(show));
        }
        if let Some(status) = &self.status {
            el = el.with_child(Element::new("status", namespaces::CLIENT).with_text(status));
        }
        if let Some(priority) = self.priority {
            el = el.with_child(
                Element::new("priority", namespaces::CLIENT).with_text(priority.to_string()),
            );
        }
        for ext in &self.extensions {
            el = el.with_child(ext.clone());
        }
        el
    }
}

// ── Stanza error descriptor ──────────────────────────────

/// The `<error/>` child of a stanza: type attribute, defined condition
/// from `urn:ietf:params:xml:ns:xmpp-stanzas`, optional text.
#[derive(Debug, Clone, PartialEq)]
pub struct StanzaError {
    pub error_type: String,
    pub condition: String,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(error_type: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            condition: condition.into(),
            text: None,
        }
    }

    pub fn from_element(element: &Element) -> Self {
        let mut condition = String::new();
        let mut text = None;
        for child in element.child_elements() {
            if child.namespace != namespaces::STANZA_ERRORS {
                continue;
            }
            if child.name == "text" {
                text = Some(child.text());
            } else if condition.is_empty() {
                condition = child.name.clone();
            }
        }
        Self {
            error_type: element.attr("type").unwrap_or_default().to_string(),
            condition,
            text,
        }
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("error", namespaces::CLIENT);
        if !self.error_type.is_empty() {
            el.set_attr("type", &self.error_type);
        }
        if !self.condition.is_empty() {
            el = el.with_child(Element::new(&self.condition, namespaces::STANZA_ERRORS));
        }
        if let Some(text) = &self.text {
            el = el.with_child(Element::new("text", namespaces::STANZA_ERRORS).with_text(text));
        }
        el
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::framer::{Frame, StreamFramer};

    fn parse_stanza(xml: &str) -> Stanza {
        let mut framer = StreamFramer::new();
        framer.push(
            b"<stream:stream xmlns='jabber:client' \
              xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>",
        );
        framer.next_frame().unwrap().unwrap();
        framer.push(xml.as_bytes());
        match framer.next_frame().unwrap().unwrap() {
            Frame::Element(el) => Stanza::from_element(&el).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    // ── IQ ──────────────────────────────────────────────

    #[test]
    fn test_iq_get_roundtrip() {
        let iq = Iq::get(Element::new("ping", namespaces::PING))
            .with_id("ping_1")
            .with_to("example.com");
        let parsed = parse_stanza(&iq.to_element().to_xml());
        assert_eq!(parsed, Stanza::Iq(iq));
    }

    #[test]
    fn test_iq_error_descriptor_parsed() {
        let stanza = parse_stanza(
            "<iq type='error' id='q1' from='example.com'>\
             <ping xmlns='urn:xmpp:ping'/>\
             <error type='cancel'>\
             <service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
             <text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>nope</text>\
             </error></iq>",
        );
        let Stanza::Iq(iq) = stanza else {
            panic!("not an iq")
        };
        assert_eq!(iq.kind, IqKind::Error);
        let error = iq.error.unwrap();
        assert_eq!(error.error_type, "cancel");
        assert_eq!(error.condition, "service-unavailable");
        assert_eq!(error.text.as_deref(), Some("nope"));
    }

    #[test]
    fn test_iq_result_for_swaps_addresses() {
        let request = Iq {
            id: "s1".into(),
            from: Some("example.com".into()),
            to: Some("me@example.com/r".into()),
            kind: IqKind::Get,
            payload: Some(Element::new("ping", namespaces::PING)),
            error: None,
        };
        let result = Iq::result_for(&request);
        assert_eq!(result.id, "s1");
        assert_eq!(result.to.as_deref(), Some("example.com"));
        assert_eq!(result.from.as_deref(), Some("me@example.com/r"));
        assert!(result.payload.is_none());
    }

    #[test]
    fn test_iq_generated_ids_are_unique() {
        let a = Iq::get(Element::new("ping", namespaces::PING));
        let b = Iq::get(Element::new("ping", namespaces::PING));
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_iq_without_type_rejected() {
        let el = Element::new("iq", namespaces::CLIENT).with_attr("id", "1");
        assert!(Iq::from_element(&el).is_err());
    }

    // ── Message ─────────────────────────────────────────

    #[test]
    fn test_message_roundtrip_with_extension() {
        let mut message = Message::chat("b@example.com", "hello & <world>");
        message.thread = Some("t1".into());
        message
            .extensions
            .push(Element::new("active", "http://jabber.org/protocol/chatstates"));
        let parsed = parse_stanza(&message.to_element().to_xml());
        assert_eq!(parsed, Stanza::Message(message));
    }

    #[test]
    fn test_message_type_defaults_to_normal() {
        let stanza = parse_stanza("<message from='a@x'><body>hi</body></message>");
        let Stanza::Message(m) = stanza else {
            panic!("not a message")
        };
        assert_eq!(m.kind, MessageKind::Normal);
        assert_eq!(m.body.as_deref(), Some("hi"));
    }

    #[test]
    fn test_normal_message_omits_type_on_wire() {
        let m = Message {
            body: Some("x".into()),
            ..Message::default()
        };
        assert!(!m.to_element().to_xml().contains("type="));
    }

    // ── Presence ────────────────────────────────────────

    #[test]
    fn test_available_presence_has_no_type_attribute() {
        assert_eq!(Presence::available().to_element().to_xml(), "<presence/>");
    }

    #[test]
    fn test_presence_roundtrip() {
        let presence = Presence {
            from: Some("a@x/r".into()),
            kind: PresenceKind::Available,
            show: Some("away".into()),
            status: Some("brb".into()),
            priority: Some(-1),
            ..Presence::default()
        };
        let parsed = parse_stanza(&presence.to_element().to_xml());
        assert_eq!(parsed, Stanza::Presence(presence));
    }

    #[test]
    fn test_presence_subscribe_parsed() {
        let stanza = parse_stanza("<presence from='a@x' type='subscribe'/>");
        let Stanza::Presence(p) = stanza else {
            panic!("not a presence")
        };
        assert_eq!(p.kind, PresenceKind::Subscribe);
    }

    // ── dispatch ────────────────────────────────────────

    #[test]
    fn test_non_stanza_element_rejected() {
        let el = Element::new("features", namespaces::STREAMS);
        assert!(Stanza::from_element(&el).is_err());
    }
}
