/// Connection driver: owns the transport and the framer, executes the
/// negotiator's actions, and dispatches session traffic.
///
/// One task does all reads, negotiation, and dispatch; outbound stanzas
/// from other threads arrive over the command channel and are written in
/// arrival order, so everything that mutates connection state runs on
/// this task.
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_native_tls::{TlsConnector, TlsStream};
use tracing::{debug, info, warn};

use crate::client::events::ConnectionEvent;
use crate::client::negotiation::{Action, Negotiator, SessionState};
use crate::client::{ping, Command, Shared};
use crate::config::ConnectionConfig;
use crate::dns;
use crate::error::{Error, Result};
use crate::stanza::stream::{self, StreamElement};
use crate::stanza::{IqKind, Stanza};
use crate::xml::framer::{Frame, StreamFramer};

/// The byte stream under the framer: plain TCP or TLS-wrapped.
/// `Detached` only exists for the instant of a STARTTLS swap.
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Detached,
    #[cfg(test)]
    Mem(tokio::io::DuplexStream),
}

impl Transport {
    /// Takes the plain TCP stream out for a STARTTLS upgrade.
    fn into_plain(self) -> Result<TcpStream> {
        match self {
            Transport::Plain(tcp) => Ok(tcp),
            _ => Err(Error::Protocol(
                "STARTTLS upgrade on an already-secured transport".into(),
            )),
        }
    }
}

fn detached_io() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport detached")
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::Detached => Poll::Ready(Err(detached_io())),
            #[cfg(test)]
            Transport::Mem(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, data),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, data),
            Transport::Detached => Poll::Ready(Err(detached_io())),
            #[cfg(test)]
            Transport::Mem(s) => Pin::new(s).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::Detached => Poll::Ready(Err(detached_io())),
            #[cfg(test)]
            Transport::Mem(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::Detached => Poll::Ready(Ok(())),
            #[cfg(test)]
            Transport::Mem(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// One full connection lifecycle: connect, negotiate, serve, close.
/// Emits the lifecycle events and cleans shared state up on the way out.
pub(crate) async fn run_once(shared: Arc<Shared>) -> Result<()> {
    let result = connect_and_drive(shared.clone()).await;
    shared.clear_session();
    shared.correlator.cancel_all();
    match &result {
        Ok(()) => shared.dispatcher.dispatch(&ConnectionEvent::ConnectionClosed),
        Err(e) => {
            if matches!(e, Error::Auth(_)) {
                shared.config.auth.password.clear();
            }
            shared
                .dispatcher
                .dispatch(&ConnectionEvent::ConnectionClosedOnError {
                    cause: Arc::new(e.clone()),
                });
        }
    }
    result
}

async fn connect_and_drive(shared: Arc<Shared>) -> Result<()> {
    if shared.shutdown_requested() {
        return Ok(());
    }
    let config = shared.config.clone();

    let tcp = connect_tcp(&config).await?;
    shared.dispatcher.dispatch(&ConnectionEvent::Connected);

    let (transport, tls_active) = if config.security.direct_tls {
        let tls = tls_handshake(&config, tcp).await?;
        (Transport::Tls(Box::new(tls)), true)
    } else {
        (Transport::Plain(tcp), false)
    };

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    shared.install_sender(cmd_tx);
    drive(shared, transport, cmd_rx, tls_active).await
}

/// Tries each connect target in order; the first TCP connect that
/// completes within the timeout wins. All failures are aggregated into
/// the final error.
async fn connect_tcp(config: &ConnectionConfig) -> Result<TcpStream> {
    let targets = dns::resolve_targets(config).await?;
    let mut failures = Vec::new();
    for target in &targets {
        debug!("connecting to {target}");
        match timeout(
            config.connect_timeout(),
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        {
            Ok(Ok(stream)) => {
                info!("TCP connected to {target}");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                warn!("connect to {target} failed: {e}");
                failures.push(format!("{target}: {e}"));
            }
            Err(_) => {
                warn!("connect to {target} timed out");
                failures.push(format!("{target}: connect timed out"));
            }
        }
    }
    Err(Error::Network(format!(
        "all {} connect targets failed [{}]",
        targets.len(),
        failures.join("; ")
    )))
}

fn build_tls_connector(config: &ConnectionConfig) -> Result<TlsConnector> {
    let security = &config.security;
    let mut builder = native_tls::TlsConnector::builder();
    if !security.hostname_verification {
        builder.danger_accept_invalid_hostnames(true);
        builder.danger_accept_invalid_certs(true);
    }
    if let Some(path) = &security.trust_roots_pem {
        let pem = std::fs::read(path)
            .map_err(|e| Error::Config(format!("cannot read trust roots {path:?}: {e}")))?;
        builder.add_root_certificate(native_tls::Certificate::from_pem(&pem)?);
    }
    if let Some(path) = &security.identity_p12 {
        let archive = std::fs::read(path)
            .map_err(|e| Error::Config(format!("cannot read identity {path:?}: {e}")))?;
        let password = security.identity_password.as_deref().unwrap_or_default();
        builder.identity(native_tls::Identity::from_pkcs12(&archive, password)?);
    }
    if let Some(version) = &security.min_tls_version {
        let protocol = match version.as_str() {
            "1.0" => native_tls::Protocol::Tlsv10,
            "1.1" => native_tls::Protocol::Tlsv11,
            "1.2" => native_tls::Protocol::Tlsv12,
            other => {
                return Err(Error::Config(format!(
                    "unsupported minimum TLS version '{other}'"
                )))
            }
        };
        builder.min_protocol_version(Some(protocol));
    }
    Ok(TlsConnector::from(builder.build()?))
}

/// Runs the TLS handshake over `tcp`. SNI always carries the service
/// domain, never the SRV-resolved host.
async fn tls_handshake(config: &ConnectionConfig, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
    let connector = build_tls_connector(config)?;
    let domain = config.connection.service_domain.clone();
    match timeout(config.handshake_timeout(), connector.connect(&domain, tcp)).await {
        Ok(Ok(stream)) => {
            info!("TLS established with {domain}");
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::Tls(e.to_string())),
        Err(_) => Err(Error::Timeout("TLS handshake")),
    }
}

/// The I/O loop. Public within the crate so tests can drive an in-memory
/// transport through the full negotiation.
pub(crate) async fn drive(
    shared: Arc<Shared>,
    transport: Transport,
    cmd_rx: mpsc::Receiver<Command>,
    tls_active: bool,
) -> Result<()> {
    let mut ping_task = None;
    let result = drive_loop(&shared, transport, cmd_rx, tls_active, &mut ping_task).await;
    if let Some(task) = ping_task {
        task.abort();
    }
    result
}

async fn drive_loop(
    shared: &Arc<Shared>,
    mut transport: Transport,
    mut cmd_rx: mpsc::Receiver<Command>,
    tls_active: bool,
    ping_task: &mut Option<JoinHandle<()>>,
) -> Result<()> {
    let config = shared.config.clone();
    let mut negotiator = Negotiator::new(config.clone());
    let mut framer = StreamFramer::new();
    let mut buf = vec![0u8; 16 * 1024];

    let actions = negotiator.connected(tls_active)?;
    apply_actions(
        shared,
        actions,
        &mut transport,
        &mut framer,
        &mut negotiator,
        ping_task,
    )
    .await?;

    loop {
        tokio::select! {
            read = timeout(config.read_timeout(), transport.read(&mut buf)) => {
                let n = match read {
                    Err(_) => return Err(Error::Timeout("server traffic")),
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(0)) => return Err(Error::Network("connection closed by server".into())),
                    Ok(Ok(n)) => n,
                };
                framer.push(&buf[..n]);
                while let Some(frame) = framer.next_frame()? {
                    if negotiator.state() == SessionState::SessionActive {
                        handle_session_frame(shared, frame, &mut transport).await?;
                    } else {
                        let actions = negotiator.handle_frame(frame)?;
                        apply_actions(
                            shared,
                            actions,
                            &mut transport,
                            &mut framer,
                            &mut negotiator,
                            ping_task,
                        )
                        .await?;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Send(xml)) => {
                        transport.write_all(xml.as_bytes()).await?;
                        transport.flush().await?;
                        debug!("sent: {xml}");
                    }
                    Some(Command::Disconnect) | None => {
                        info!("closing stream");
                        let close = async {
                            let _ = transport.write_all(stream::stream_close().as_bytes()).await;
                            let _ = transport.flush().await;
                            // Give the server a moment to mirror the close.
                            let _ = timeout(
                                Duration::from_millis(100),
                                transport.read(&mut buf),
                            )
                            .await;
                            let _ = transport.shutdown().await;
                        };
                        let _ = timeout(Duration::from_secs(3), close).await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn apply_actions(
    shared: &Arc<Shared>,
    actions: Vec<Action>,
    transport: &mut Transport,
    framer: &mut StreamFramer,
    negotiator: &mut Negotiator,
    ping_task: &mut Option<JoinHandle<()>>,
) -> Result<()> {
    let mut queue = std::collections::VecDeque::from(actions);
    while let Some(action) = queue.pop_front() {
        match action {
            Action::Write(xml) => {
                transport.write_all(xml.as_bytes()).await?;
                transport.flush().await?;
                debug!("sent: {xml}");
            }
            Action::ResetFramer => framer.reset(),
            Action::UpgradeTls => {
                let tcp = std::mem::replace(transport, Transport::Detached).into_plain()?;
                let tls = tls_handshake(&shared.config, tcp).await?;
                *transport = Transport::Tls(Box::new(tls));
                queue.extend(negotiator.tls_established()?);
            }
            Action::SessionActive { jid } => {
                shared.set_bound_jid(jid);
                if shared.config.keep_alive.ping_enabled {
                    *ping_task = Some(ping::spawn(shared.clone()));
                }
                shared
                    .dispatcher
                    .dispatch(&ConnectionEvent::Authenticated { resumed: false });
            }
        }
    }
    Ok(())
}

/// SESSION_ACTIVE dispatch: correlator first, then the IQ-request handler
/// registry, then the async stanza listeners. Unknown IQ requests with no
/// handler are left to the listeners; nothing is auto-answered for them.
async fn handle_session_frame(
    shared: &Arc<Shared>,
    frame: Frame,
    transport: &mut Transport,
) -> Result<()> {
    let element = match frame {
        Frame::StreamHeader(_) => {
            return Err(Error::Protocol(
                "stream header inside an active session".into(),
            ))
        }
        Frame::StreamEnd => return Err(Error::Network("server closed the stream".into())),
        Frame::Element(element) => element,
    };

    match StreamElement::classify(&element)? {
        Some(StreamElement::StreamError { condition, text }) => {
            let detail = text.map(|t| format!(" ({t})")).unwrap_or_default();
            return Err(Error::Network(format!("stream error: {condition}{detail}")));
        }
        Some(other) => {
            return Err(Error::Protocol(format!(
                "unexpected {other:?} inside an active session"
            )))
        }
        None => {}
    }

    let stanza = Stanza::from_element(&element)?;

    if let Stanza::Iq(iq) = &stanza {
        if iq.kind.is_response() && shared.correlator.complete(iq) {
            return Ok(());
        }
        if matches!(iq.kind, IqKind::Get | IqKind::Set) {
            if let Some(payload) = &iq.payload {
                if let Some(handler) =
                    shared.handlers.get(&payload.name, &payload.namespace, iq.kind)
                {
                    if let Some(response) = handler(iq) {
                        let xml = response.to_element().to_xml();
                        transport.write_all(xml.as_bytes()).await?;
                        transport.flush().await?;
                        debug!("answered IQ {}: {xml}", iq.id);
                    }
                    return Ok(());
                }
            }
        }
    }

    shared.notify_stanza(&stanza);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DEFAULT_IQ_TIMEOUT;
    use crate::config::{ConnectionConfig, SecurityMode};
    use crate::stanza::registry::Ping;
    use crate::stanza::Iq;
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine;
    use tokio::sync::Notify;

    async fn read_until<S: AsyncReadExt + Unpin>(stream: &mut S, marker: &str) -> String {
        let mut buf = vec![0u8; 4096];
        let mut accumulated = String::new();
        loop {
            if accumulated.contains(marker) {
                return accumulated;
            }
            let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {marker}; got {accumulated}"))
                .expect("server read failed");
            assert!(n > 0, "eof while waiting for {marker}");
            accumulated.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    fn attr_value(xml: &str, attr: &str) -> String {
        xml.split(&format!("{attr}='"))
            .nth(1)
            .and_then(|s| s.split('\'').next())
            .unwrap_or_else(|| panic!("missing {attr} in {xml}"))
            .to_string()
    }

    const SERVER_HEADER: &str = "<?xml version='1.0'?>\
        <stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' \
        from='lesswhite' id='srv-1' version='1.0'>";

    #[tokio::test]
    async fn test_full_plaintext_session_over_in_memory_transport() {
        let (client_io, mut server) = tokio::io::duplex(16 * 1024);

        let config = ConnectionConfig::builder()
            .service_domain("lesswhite")
            .username("acs")
            .password("acs")
            .security_mode(SecurityMode::Disabled)
            .resource("mem")
            .build()
            .unwrap();
        let shared = Shared::new(config);

        let authenticated = Arc::new(Notify::new());
        let notify = authenticated.clone();
        shared.dispatcher.add(move |event| {
            if matches!(event, ConnectionEvent::Authenticated { resumed: false }) {
                notify.notify_one();
            }
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        shared.install_sender(cmd_tx);
        let driver = tokio::spawn(drive(
            shared.clone(),
            Transport::Mem(client_io),
            cmd_rx,
            false,
        ));

        // Stream open and features.
        let header = read_until(&mut server, ">").await;
        assert!(header.contains("to='lesswhite'"));
        assert!(header.contains("version='1.0'"));
        server
            .write_all(
                format!(
                    "{SERVER_HEADER}<stream:features>\
                     <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                     <mechanism>PLAIN</mechanism></mechanisms></stream:features>"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        // SASL PLAIN.
        let auth = read_until(&mut server, "</auth>").await;
        assert!(auth.contains("mechanism='PLAIN'"));
        assert!(auth.contains(&B64.encode(b"\0acs\0acs")));
        server
            .write_all(b"<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await
            .unwrap();

        // Restarted stream and binding.
        let restart = read_until(&mut server, ">").await;
        assert!(restart.contains("<stream:stream"));
        server
            .write_all(
                format!(
                    "{SERVER_HEADER}<stream:features>\
                     <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let bind = read_until(&mut server, "</iq>").await;
        assert!(bind.contains("<resource>mem</resource>"));
        let bind_id = attr_value(&bind, "id");
        server
            .write_all(
                format!(
                    "<iq type='result' id='{bind_id}'>\
                     <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                     <jid>acs@lesswhite/mem</jid></bind></iq>"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        // Initial presence, then the session is up.
        let presence = read_until(&mut server, "<presence/>").await;
        assert!(presence.contains("<presence/>"));
        timeout(Duration::from_secs(5), authenticated.notified())
            .await
            .expect("authenticated event not observed");
        assert_eq!(shared.bound_jid().as_deref(), Some("acs@lesswhite/mem"));

        // Server-initiated ping is answered automatically.
        server
            .write_all(
                b"<iq type='get' id='s-ping-1' from='lesswhite'>\
                  <ping xmlns='urn:xmpp:ping'/></iq>",
            )
            .await
            .unwrap();
        let reply = read_until(&mut server, "/>").await;
        assert!(reply.contains("type='result'"));
        assert!(reply.contains("id='s-ping-1'"));
        assert!(reply.contains("to='lesswhite'"));

        // Client ping goes through the correlator.
        let iq_shared = shared.clone();
        let pending = tokio::spawn(async move {
            let iq = Iq::get(Ping::to_element())
                .with_id("ping_1")
                .with_to("lesswhite");
            iq_shared.send_iq(iq, DEFAULT_IQ_TIMEOUT).await
        });
        let ping = read_until(&mut server, "</iq>").await;
        assert!(ping.contains("id='ping_1'"));
        assert!(ping.contains("urn:xmpp:ping"));
        server
            .write_all(b"<iq type='result' id='ping_1' from='lesswhite'/>")
            .await
            .unwrap();
        let response = timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.kind, IqKind::Result);

        // Clean shutdown closes the stream and resolves the driver.
        shared.request_shutdown();
        let close = read_until(&mut server, "</stream:stream>").await;
        assert!(close.contains("</stream:stream>"));
        let outcome = timeout(Duration::from_secs(5), driver).await.unwrap();
        assert!(outcome.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_sasl_failure_fails_the_driver() {
        let (client_io, mut server) = tokio::io::duplex(16 * 1024);
        let config = ConnectionConfig::builder()
            .service_domain("lesswhite")
            .username("acs")
            .password("wrong")
            .security_mode(SecurityMode::Disabled)
            .build()
            .unwrap();
        let shared = Shared::new(config);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        shared.install_sender(cmd_tx);
        let driver = tokio::spawn(drive(
            shared.clone(),
            Transport::Mem(client_io),
            cmd_rx,
            false,
        ));

        read_until(&mut server, ">").await;
        server
            .write_all(
                format!(
                    "{SERVER_HEADER}<stream:features>\
                     <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                     <mechanism>PLAIN</mechanism></mechanisms></stream:features>"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        read_until(&mut server, "</auth>").await;
        server
            .write_all(
                b"<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                  <not-authorized/></failure>",
            )
            .await
            .unwrap();

        let outcome = timeout(Duration::from_secs(5), driver).await.unwrap();
        assert!(matches!(outcome.unwrap(), Err(Error::Auth(_))));
    }
}
