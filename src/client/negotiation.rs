/// The negotiation state machine.
///
/// Drives the ordered progression from transport-connected to a bound,
/// usable session: stream open, optional STARTTLS upgrade, SASL, stream
/// restarts, resource binding. The machine itself performs no I/O; each
/// input (a decoded frame, a TLS-handshake completion) yields a list of
/// [`Action`]s for the connection driver to execute. Any transition
/// outside the allowed table is a programming error and aborts the
/// connection.
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{ConnectionConfig, SecurityMode};
use crate::error::{Error, Result};
use crate::sasl::{Mechanism, MechanismRegistry, SaslContext};
use crate::stanza::registry::{Bind, ProviderRegistry};
use crate::stanza::stream::{self, StreamElement, StreamFeatures};
use crate::stanza::{Iq, IqKind, Presence, Stanza};
use crate::xml::framer::Frame;
use crate::xml::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Connecting,
    AwaitingFeatures,
    TlsNegotiating,
    SaslAuth,
    Binding,
    SessionActive,
}

/// An instruction for the connection driver.
#[derive(Debug)]
pub enum Action {
    /// Write these bytes to the transport.
    Write(String),
    /// Insert the TLS engine and drive the handshake; report back through
    /// [`Negotiator::tls_established`].
    UpgradeTls,
    /// Rebind the framer for the fresh stream that follows.
    ResetFramer,
    /// Negotiation finished; the session is usable under this full JID.
    SessionActive { jid: String },
}

pub struct Negotiator {
    config: Arc<ConnectionConfig>,
    state: SessionState,
    tls_active: bool,
    authenticated: bool,
    mechanism: Option<Box<dyn Mechanism>>,
    bind_id: Option<String>,
}

impl Negotiator {
    pub fn new(config: Arc<ConnectionConfig>) -> Self {
        Self {
            config,
            state: SessionState::Initial,
            tls_active: false,
            authenticated: false,
            mechanism: None,
            bind_id: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Validates a state change against the allowed-transition table.
    pub(crate) fn transition(&mut self, to: SessionState) -> Result<()> {
        use SessionState::*;
        let allowed = matches!(
            (self.state, to),
            (Initial, Connecting)
                | (Connecting, AwaitingFeatures)
                | (AwaitingFeatures, TlsNegotiating)
                | (AwaitingFeatures, SaslAuth)
                | (AwaitingFeatures, Binding)
                | (TlsNegotiating, AwaitingFeatures)
                | (SaslAuth, AwaitingFeatures)
                | (Binding, SessionActive)
                // reset_state() after disconnect, for reconnection
                | (_, Connecting)
        );
        if !allowed {
            return Err(Error::Protocol(format!(
                "illegal transition {:?} -> {to:?}",
                self.state
            )));
        }
        debug!("negotiation state {:?} -> {to:?}", self.state);
        self.state = to;
        Ok(())
    }

    /// Restarts negotiation from CONNECTING for a reconnection attempt.
    pub fn reset(&mut self) {
        self.state = SessionState::Connecting;
        self.tls_active = false;
        self.authenticated = false;
        self.mechanism = None;
        self.bind_id = None;
    }

    /// The transport is up. `tls_active` is true for Direct TLS, where
    /// the handshake completed before the first byte.
    pub fn connected(&mut self, tls_active: bool) -> Result<Vec<Action>> {
        self.tls_active = tls_active;
        self.transition(SessionState::Connecting)?;
        Ok(vec![Action::Write(self.stream_header())])
    }

    /// The STARTTLS handshake finished; restart the stream over TLS.
    pub fn tls_established(&mut self) -> Result<Vec<Action>> {
        self.tls_active = true;
        self.transition(SessionState::AwaitingFeatures)?;
        Ok(vec![
            Action::ResetFramer,
            Action::Write(self.stream_header()),
        ])
    }

    pub fn handle_frame(&mut self, frame: Frame) -> Result<Vec<Action>> {
        match frame {
            Frame::StreamHeader(_) => match self.state {
                SessionState::Connecting => {
                    self.transition(SessionState::AwaitingFeatures)?;
                    Ok(Vec::new())
                }
                // The header of a restarted stream after TLS or SASL.
                SessionState::AwaitingFeatures => Ok(Vec::new()),
                _ => Err(Error::Protocol(format!(
                    "stream header in state {:?}",
                    self.state
                ))),
            },
            Frame::StreamEnd => Err(Error::Network("server closed the stream".into())),
            Frame::Element(element) => match StreamElement::classify(&element)? {
                Some(stream_element) => self.handle_stream_element(stream_element),
                None => self.handle_stanza(&element),
            },
        }
    }

    fn handle_stream_element(&mut self, element: StreamElement) -> Result<Vec<Action>> {
        match (element, self.state) {
            (StreamElement::Features(features), SessionState::AwaitingFeatures) => {
                self.choose_next(features)
            }
            (StreamElement::TlsProceed, SessionState::TlsNegotiating) => {
                Ok(vec![Action::UpgradeTls])
            }
            (StreamElement::TlsFailure, _) => {
                Err(Error::Tls("server refused the STARTTLS request".into()))
            }
            (StreamElement::SaslChallenge(challenge), SessionState::SaslAuth) => {
                let mechanism = self
                    .mechanism
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("challenge without a mechanism".into()))?;
                let response = mechanism.respond(&challenge)?;
                Ok(vec![Action::Write(stream::response(&response).to_xml())])
            }
            (StreamElement::SaslSuccess(data), SessionState::SaslAuth) => {
                let mut mechanism = self
                    .mechanism
                    .take()
                    .ok_or_else(|| Error::Protocol("success without a mechanism".into()))?;
                mechanism.verify_success(data.as_deref())?;
                if !mechanism.is_complete() {
                    return Err(Error::Auth(
                        "server reported success before the mechanism completed".into(),
                    ));
                }
                info!("SASL authentication successful");
                self.authenticated = true;
                self.transition(SessionState::AwaitingFeatures)?;
                Ok(vec![
                    Action::ResetFramer,
                    Action::Write(self.stream_header()),
                ])
            }
            (StreamElement::SaslFailure { condition, text }, _) => {
                let detail = text.map(|t| format!(" ({t})")).unwrap_or_default();
                Err(Error::Auth(format!("SASL failure: {condition}{detail}")))
            }
            (StreamElement::StreamError { condition, text }, _) => {
                let detail = text.map(|t| format!(" ({t})")).unwrap_or_default();
                Err(Error::Network(format!("stream error: {condition}{detail}")))
            }
            (element, state) => Err(Error::Protocol(format!(
                "unexpected {element:?} in state {state:?}"
            ))),
        }
    }

    /// Picks the next sub-protocol from a freshly received features set.
    /// TLS wins the tie-break when both TLS and SASL are on offer.
    fn choose_next(&mut self, features: StreamFeatures) -> Result<Vec<Action>> {
        if self.authenticated {
            if !features.bind {
                return Err(Error::Auth(
                    "server does not advertise resource binding".into(),
                ));
            }
            let iq = Iq::set(Bind::request(self.config.connection.resource.as_deref()));
            self.bind_id = Some(iq.id.clone());
            self.transition(SessionState::Binding)?;
            return Ok(vec![Action::Write(iq.to_element().to_xml())]);
        }

        let security = &self.config.security;
        if features.starttls && security.mode != SecurityMode::Disabled && !self.tls_active {
            self.transition(SessionState::TlsNegotiating)?;
            return Ok(vec![Action::Write(stream::starttls_request().to_xml())]);
        }
        if security.mode == SecurityMode::Required && !self.tls_active {
            return Err(Error::Tls(
                "security mode is REQUIRED but the server does not offer STARTTLS".into(),
            ));
        }
        if features.mechanisms.is_empty() {
            return Err(Error::Auth("server advertises no SASL mechanisms".into()));
        }

        // DISABLED is an explicit decision to run in the clear, so it also
        // unlocks PLAIN; otherwise PLAIN stays TLS-only unless the
        // configuration says so.
        let allow_plain =
            security.allow_plain_without_tls || security.mode == SecurityMode::Disabled;
        let chosen = MechanismRegistry::global()
            .select(
                &features.mechanisms,
                self.config.connection.enabled_sasl_mechanisms.as_deref(),
                self.tls_active,
                allow_plain,
            )
            .ok_or_else(|| {
                Error::Auth(format!(
                    "no usable SASL mechanism (server offers {:?})",
                    features.mechanisms
                ))
            })?;

        let ctx = SaslContext {
            username: self.config.auth.username.clone(),
            password: self.config.auth.password.reveal(),
            authzid: self.config.auth.authzid.clone(),
            min_scram_iterations: security.min_scram_iterations,
        };
        let mut mechanism = MechanismRegistry::global().create(&chosen, &ctx)?;
        info!("authenticating as {} with {chosen}", ctx.username);

        let initial = if mechanism.has_initial_response() {
            Some(mechanism.initial()?)
        } else {
            None
        };
        let auth = stream::auth(mechanism.name(), initial.as_deref());
        self.mechanism = Some(mechanism);
        self.transition(SessionState::SaslAuth)?;
        Ok(vec![Action::Write(auth.to_xml())])
    }

    fn handle_stanza(&mut self, element: &Element) -> Result<Vec<Action>> {
        if self.state != SessionState::Binding {
            return Err(Error::Protocol(format!(
                "stanza <{}> received in state {:?}",
                element.name, self.state
            )));
        }

        let stanza = Stanza::from_element(element)?;
        let Stanza::Iq(iq) = stanza else {
            // Early pushes (presence probes etc.) before bind completes.
            debug!("ignoring non-IQ stanza during binding");
            return Ok(Vec::new());
        };
        if Some(&iq.id) != self.bind_id.as_ref() {
            debug!("ignoring unrelated IQ {} during binding", iq.id);
            return Ok(Vec::new());
        }

        match iq.kind {
            IqKind::Result => {
                let payload = iq
                    .payload
                    .ok_or_else(|| Error::Auth("bind result carries no payload".into()))?;
                let bind: Bind = ProviderRegistry::global()
                    .decode(&payload)
                    .ok_or_else(|| Error::Auth("malformed bind result".into()))?;
                let jid = bind
                    .jid
                    .filter(|jid| !jid.is_empty())
                    .ok_or_else(|| Error::Auth("bind result carries no JID".into()))?;
                info!("bound as {jid}");
                self.transition(SessionState::SessionActive)?;

                let mut actions = Vec::new();
                if self.config.connection.send_presence {
                    actions.push(Action::Write(
                        Presence::available().to_element().to_xml(),
                    ));
                }
                actions.push(Action::SessionActive { jid });
                Ok(actions)
            }
            IqKind::Error => {
                let detail = iq
                    .error
                    .map(|e| e.condition)
                    .unwrap_or_else(|| "unknown condition".into());
                Err(Error::Auth(format!("resource binding failed: {detail}")))
            }
            _ => {
                debug!("ignoring IQ request during binding");
                Ok(Vec::new())
            }
        }
    }

    fn stream_header(&self) -> String {
        stream::stream_header(
            &self.config.connection.service_domain,
            self.config.language(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::xml::framer::StreamHeader;
    use crate::xml::namespaces;

    fn config(mode: SecurityMode) -> Arc<ConnectionConfig> {
        Arc::new(
            ConnectionConfig::builder()
                .service_domain("lesswhite")
                .username("acs")
                .password("acs")
                .security_mode(mode)
                .resource("test")
                .build()
                .unwrap(),
        )
    }

    fn header_frame() -> Frame {
        Frame::StreamHeader(StreamHeader::default())
    }

    fn features(mechanisms: &[&str], starttls: bool, bind: bool) -> Frame {
        let mut el = Element::new("features", namespaces::STREAMS);
        if starttls {
            el = el.with_child(Element::new("starttls", namespaces::TLS));
        }
        if !mechanisms.is_empty() {
            let mut mechs = Element::new("mechanisms", namespaces::SASL);
            for m in mechanisms {
                mechs =
                    mechs.with_child(Element::new("mechanism", namespaces::SASL).with_text(*m));
            }
            el = el.with_child(mechs);
        }
        if bind {
            el = el.with_child(Element::new("bind", namespaces::BIND));
        }
        Frame::Element(el)
    }

    fn success_frame() -> Frame {
        Frame::Element(Element::new("success", namespaces::SASL))
    }

    fn bind_result(id: &str, jid: &str) -> Frame {
        Frame::Element(
            Element::new("iq", namespaces::CLIENT)
                .with_attr("type", "result")
                .with_attr("id", id)
                .with_child(
                    Element::new("bind", namespaces::BIND)
                        .with_child(Element::new("jid", namespaces::BIND).with_text(jid)),
                ),
        )
    }

    fn written(actions: &[Action]) -> String {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Write(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Drives a disabled-security negotiation up to SASL_AUTH over PLAIN.
    fn negotiator_in_sasl() -> Negotiator {
        let mut n = Negotiator::new(config(SecurityMode::Disabled));
        n.connected(false).unwrap();
        n.handle_frame(header_frame()).unwrap();
        n.handle_frame(features(&["PLAIN"], false, false)).unwrap();
        assert_eq!(n.state(), SessionState::SaslAuth);
        n
    }

    fn negotiator_active() -> Negotiator {
        let mut n = negotiator_in_sasl();
        n.handle_frame(success_frame()).unwrap();
        n.handle_frame(header_frame()).unwrap();
        let actions = n.handle_frame(features(&[], false, true)).unwrap();
        let bind_xml = written(&actions);
        let id = bind_xml
            .split("id='")
            .nth(1)
            .and_then(|s| s.split('\'').next())
            .unwrap()
            .to_string();
        n.handle_frame(bind_result(&id, "acs@lesswhite/test")).unwrap();
        assert_eq!(n.state(), SessionState::SessionActive);
        n
    }

    // ── transition table ────────────────────────────────

    #[test]
    fn test_initial_only_connects() {
        let mut n = Negotiator::new(config(SecurityMode::Required));
        assert!(matches!(
            n.transition(SessionState::AwaitingFeatures),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            n.transition(SessionState::SessionActive),
            Err(Error::Protocol(_))
        ));
        n.transition(SessionState::Connecting).unwrap();
    }

    #[test]
    fn test_session_active_only_reconnects() {
        let mut n = negotiator_active();
        assert!(matches!(
            n.transition(SessionState::Binding),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            n.transition(SessionState::SaslAuth),
            Err(Error::Protocol(_))
        ));
        n.transition(SessionState::Connecting).unwrap();
    }

    #[test]
    fn test_reset_restarts_from_connecting() {
        let mut n = negotiator_active();
        n.reset();
        assert_eq!(n.state(), SessionState::Connecting);
        // A fresh stream header is acceptable again.
        n.handle_frame(header_frame()).unwrap();
        assert_eq!(n.state(), SessionState::AwaitingFeatures);
    }

    // ── feature dispatch ────────────────────────────────

    #[test]
    fn test_required_without_starttls_fails_before_sasl() {
        let mut n = Negotiator::new(config(SecurityMode::Required));
        n.connected(false).unwrap();
        n.handle_frame(header_frame()).unwrap();
        let err = n
            .handle_frame(features(&["SCRAM-SHA-1"], false, false))
            .unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
        assert_ne!(n.state(), SessionState::SaslAuth);
    }

    #[test]
    fn test_tls_wins_tie_break_over_sasl() {
        let mut n = Negotiator::new(config(SecurityMode::Required));
        n.connected(false).unwrap();
        n.handle_frame(header_frame()).unwrap();
        let actions = n
            .handle_frame(features(&["SCRAM-SHA-1"], true, false))
            .unwrap();
        assert!(written(&actions).contains("<starttls"));
        assert_eq!(n.state(), SessionState::TlsNegotiating);
    }

    #[test]
    fn test_proceed_triggers_tls_upgrade_and_stream_restart() {
        let mut n = Negotiator::new(config(SecurityMode::Required));
        n.connected(false).unwrap();
        n.handle_frame(header_frame()).unwrap();
        n.handle_frame(features(&[], true, false)).unwrap();
        let actions = n
            .handle_frame(Frame::Element(Element::new("proceed", namespaces::TLS)))
            .unwrap();
        assert!(matches!(actions[0], Action::UpgradeTls));

        let actions = n.tls_established().unwrap();
        assert!(matches!(actions[0], Action::ResetFramer));
        assert!(written(&actions).contains("<stream:stream"));
        assert_eq!(n.state(), SessionState::AwaitingFeatures);
    }

    #[test]
    fn test_direct_tls_skips_tls_negotiating() {
        let mut n = Negotiator::new(config(SecurityMode::Required));
        n.connected(true).unwrap();
        n.handle_frame(header_frame()).unwrap();
        let actions = n
            .handle_frame(features(&["SCRAM-SHA-1"], false, false))
            .unwrap();
        assert!(written(&actions).contains("mechanism='SCRAM-SHA-1'"));
        assert_eq!(n.state(), SessionState::SaslAuth);
    }

    #[test]
    fn test_default_config_prefers_scram_sha256() {
        let mut n = Negotiator::new(config(SecurityMode::Required));
        n.connected(true).unwrap();
        n.handle_frame(header_frame()).unwrap();
        let actions = n
            .handle_frame(features(
                &["PLAIN", "SCRAM-SHA-1", "SCRAM-SHA-256"],
                false,
                false,
            ))
            .unwrap();
        assert!(written(&actions).contains("mechanism='SCRAM-SHA-256'"));
    }

    #[test]
    fn test_plain_filter_with_disabled_security() {
        let config = Arc::new(
            ConnectionConfig::builder()
                .service_domain("lesswhite")
                .username("acs")
                .password("acs")
                .security_mode(SecurityMode::Disabled)
                .enabled_sasl_mechanisms(["PLAIN"])
                .build()
                .unwrap(),
        );
        let mut n = Negotiator::new(config);
        n.connected(false).unwrap();
        n.handle_frame(header_frame()).unwrap();
        let actions = n
            .handle_frame(features(
                &["PLAIN", "SCRAM-SHA-1", "SCRAM-SHA-256"],
                false,
                false,
            ))
            .unwrap();
        assert!(written(&actions).contains("mechanism='PLAIN'"));
    }

    #[test]
    fn test_no_usable_mechanism_fails() {
        let mut n = Negotiator::new(config(SecurityMode::Disabled));
        n.connected(false).unwrap();
        n.handle_frame(header_frame()).unwrap();
        let err = n
            .handle_frame(features(&["EXTERNAL"], false, false))
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    // ── SASL outcome ────────────────────────────────────

    #[test]
    fn test_success_restarts_stream_and_awaits_bind_features() {
        let mut n = negotiator_in_sasl();
        let actions = n.handle_frame(success_frame()).unwrap();
        assert!(matches!(actions[0], Action::ResetFramer));
        assert!(written(&actions).contains("<stream:stream"));
        assert_eq!(n.state(), SessionState::AwaitingFeatures);
    }

    #[test]
    fn test_sasl_failure_is_fatal() {
        let mut n = negotiator_in_sasl();
        let failure = Element::new("failure", namespaces::SASL)
            .with_child(Element::new("not-authorized", namespaces::SASL));
        let err = n.handle_frame(Frame::Element(failure)).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn test_challenge_outside_sasl_is_protocol_error() {
        let mut n = Negotiator::new(config(SecurityMode::Disabled));
        n.connected(false).unwrap();
        let challenge = Element::new("challenge", namespaces::SASL).with_text("");
        assert!(matches!(
            n.handle_frame(Frame::Element(challenge)),
            Err(Error::Protocol(_))
        ));
    }

    // ── binding ─────────────────────────────────────────

    #[test]
    fn test_bind_flow_reaches_session_active_with_presence() {
        let mut n = negotiator_in_sasl();
        n.handle_frame(success_frame()).unwrap();
        n.handle_frame(header_frame()).unwrap();
        let actions = n.handle_frame(features(&[], false, true)).unwrap();
        let bind_xml = written(&actions);
        assert!(bind_xml.contains("type='set'"));
        assert!(bind_xml.contains("<resource>test</resource>"));
        assert_eq!(n.state(), SessionState::Binding);

        let id = bind_xml
            .split("id='")
            .nth(1)
            .and_then(|s| s.split('\'').next())
            .unwrap()
            .to_string();
        let actions = n
            .handle_frame(bind_result(&id, "acs@lesswhite/test"))
            .unwrap();
        assert!(written(&actions).contains("<presence/>"));
        assert!(matches!(
            actions.last(),
            Some(Action::SessionActive { jid }) if jid == "acs@lesswhite/test"
        ));
    }

    #[test]
    fn test_features_without_bind_after_auth_fails() {
        let mut n = negotiator_in_sasl();
        n.handle_frame(success_frame()).unwrap();
        n.handle_frame(header_frame()).unwrap();
        assert!(matches!(
            n.handle_frame(features(&[], false, false)),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn test_bind_error_is_auth_failure() {
        let mut n = negotiator_in_sasl();
        n.handle_frame(success_frame()).unwrap();
        n.handle_frame(header_frame()).unwrap();
        let actions = n.handle_frame(features(&[], false, true)).unwrap();
        let id = written(&actions)
            .split("id='")
            .nth(1)
            .and_then(|s| s.split('\'').next())
            .unwrap()
            .to_string();

        let error_iq = Element::new("iq", namespaces::CLIENT)
            .with_attr("type", "error")
            .with_attr("id", &id)
            .with_child(
                Element::new("error", namespaces::CLIENT).with_child(Element::new(
                    "resource-constraint",
                    namespaces::STANZA_ERRORS,
                )),
            );
        let err = n.handle_frame(Frame::Element(error_iq)).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn test_unrelated_stanzas_ignored_during_binding() {
        let mut n = negotiator_in_sasl();
        n.handle_frame(success_frame()).unwrap();
        n.handle_frame(header_frame()).unwrap();
        n.handle_frame(features(&[], false, true)).unwrap();
        let presence = Element::new("presence", namespaces::CLIENT).with_attr("from", "a@x");
        assert!(n.handle_frame(Frame::Element(presence)).unwrap().is_empty());
        assert_eq!(n.state(), SessionState::Binding);
    }

    // ── stream-level errors ─────────────────────────────

    #[test]
    fn test_stream_error_surfaces_condition() {
        let mut n = negotiator_in_sasl();
        let error = Element::new("error", namespaces::STREAMS)
            .with_child(Element::new("conflict", namespaces::STREAM_ERRORS));
        let err = n.handle_frame(Frame::Element(error)).unwrap_err();
        assert!(err.to_string().contains("conflict"));
    }

    #[test]
    fn test_stream_end_reports_closed() {
        let mut n = negotiator_active();
        assert!(matches!(
            n.handle_frame(Frame::StreamEnd),
            Err(Error::Network(_))
        ));
    }
}
