//! An asynchronous XMPP 1.0 (RFC 6120) client connection core.
//!
//! The crate covers the hard part of being an XMPP endpoint: the framing
//! of the inbound XML stream, the multi-phase negotiation state machine
//! (STARTTLS, SASL with the SCRAM family, resource binding), correlated
//! IQ request/response handling, DNS SRV discovery, and the keep-alive
//! and reconnection supervisors. Messaging features beyond that (rosters,
//! MUC, presence semantics) are left to the application on top.
//!
//! Entry point: build a [`ConnectionConfig`], hand it to [`XmppClient`],
//! subscribe to [`ConnectionEvent`]s, and call [`XmppClient::run`].

pub mod backoff;
pub mod client;
pub mod config;
pub mod dns;
pub mod error;
pub mod sasl;
pub mod stanza;
pub mod xml;

pub use client::{ConnectionEvent, ListenerId, XmppClient, DEFAULT_IQ_TIMEOUT};
pub use config::{ConnectionConfig, ConnectionConfigBuilder, SecurityMode};
pub use error::{Error, Result};
pub use stanza::{Iq, IqKind, Message, MessageKind, Presence, PresenceKind, Stanza, StanzaError};
pub use xml::Element;
