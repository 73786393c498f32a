/// The client endpoint: public API over one supervised connection.
///
/// All handle operations are safe from any thread; anything that touches
/// the wire is marshaled onto the connection's I/O task through a command
/// channel, so state-machine work stays single-threaded.
pub mod connection;
pub mod correlator;
pub mod events;
pub mod negotiation;
pub mod ping;
pub mod reconnect;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::warn;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::stanza::registry::Ping;
use crate::stanza::{Iq, IqKind, Stanza};

pub use events::{ConnectionEvent, ListenerId};

/// Default deadline for an IQ response.
pub const DEFAULT_IQ_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles an incoming IQ get/set; the returned stanza (if any) is
/// written back as the response.
pub type IqHandler = Arc<dyn Fn(&Iq) -> Option<Iq> + Send + Sync>;

type StanzaFilter = Arc<dyn Fn(&Stanza) -> bool + Send + Sync>;
type StanzaCallback = Arc<dyn Fn(&Stanza) + Send + Sync>;

pub(crate) enum Command {
    /// Pre-serialized stanza bytes for the writer.
    Send(String),
    /// Close the stream gracefully.
    Disconnect,
}

/// Registry of IQ request handlers keyed by
/// `(payload name, payload namespace, iq type)`.
pub(crate) struct IqHandlerRegistry {
    map: DashMap<(String, String, IqKind), IqHandler>,
}

impl IqHandlerRegistry {
    fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    pub(crate) fn set(&self, name: &str, namespace: &str, kind: IqKind, handler: IqHandler) {
        self.map
            .insert((name.to_string(), namespace.to_string(), kind), handler);
    }

    pub(crate) fn remove(&self, name: &str, namespace: &str, kind: IqKind) -> bool {
        self.map
            .remove(&(name.to_string(), namespace.to_string(), kind))
            .is_some()
    }

    pub(crate) fn get(&self, name: &str, namespace: &str, kind: IqKind) -> Option<IqHandler> {
        self.map
            .get(&(name.to_string(), namespace.to_string(), kind))
            .map(|entry| entry.value().clone())
    }
}

struct StanzaListener {
    id: ListenerId,
    filter: StanzaFilter,
    callback: StanzaCallback,
}

/// State shared between the public handle and the connection task.
pub(crate) struct Shared {
    pub(crate) config: Arc<ConnectionConfig>,
    pub(crate) correlator: correlator::Correlator,
    pub(crate) handlers: IqHandlerRegistry,
    pub(crate) dispatcher: events::EventDispatcher,
    stanza_listeners: Mutex<Vec<StanzaListener>>,
    next_listener_id: AtomicU64,
    cmd_tx: Mutex<Option<mpsc::Sender<Command>>>,
    bound_jid: Mutex<Option<String>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn new(config: ConnectionConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Self {
            config: Arc::new(config),
            correlator: correlator::Correlator::new(),
            handlers: IqHandlerRegistry::new(),
            dispatcher: events::EventDispatcher::new(),
            stanza_listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            cmd_tx: Mutex::new(None),
            bound_jid: Mutex::new(None),
            shutdown,
        });
        // Built-in XEP-0199 responder: answer server pings with an empty
        // result echoing the id.
        shared.handlers.set(
            Ping::NAME,
            Ping::NS,
            IqKind::Get,
            Arc::new(|iq| Some(Iq::result_for(iq))),
        );
        shared
    }

    pub(crate) fn install_sender(&self, tx: mpsc::Sender<Command>) {
        *self.cmd_tx.lock().expect("cmd lock poisoned") = Some(tx);
    }

    pub(crate) fn clear_session(&self) {
        *self.cmd_tx.lock().expect("cmd lock poisoned") = None;
        *self.bound_jid.lock().expect("jid lock poisoned") = None;
    }

    pub(crate) fn set_bound_jid(&self, jid: String) {
        *self.bound_jid.lock().expect("jid lock poisoned") = Some(jid);
    }

    pub(crate) fn bound_jid(&self) -> Option<String> {
        self.bound_jid.lock().expect("jid lock poisoned").clone()
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn sender(&self) -> Option<mpsc::Sender<Command>> {
        self.cmd_tx.lock().expect("cmd lock poisoned").clone()
    }

    pub(crate) async fn send_raw(&self, xml: String) -> Result<()> {
        let tx = self
            .sender()
            .ok_or_else(|| Error::Network("not connected".into()))?;
        tx.send(Command::Send(xml))
            .await
            .map_err(|_| Error::Network("connection is shutting down".into()))
    }

    /// Registers the pending entry, writes the request, and awaits the
    /// matching response under the deadline. Late responses after a
    /// timeout are dropped by the correlator.
    pub(crate) async fn send_iq(&self, iq: Iq, deadline: Duration) -> Result<Iq> {
        let rx = self.correlator.register(&iq.id)?;
        let id = iq.id.clone();
        if let Err(e) = self.send_raw(iq.to_element().to_xml()).await {
            self.correlator.remove(&id);
            return Err(e);
        }
        match timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.correlator.remove(&id);
                Err(Error::Timeout("IQ response"))
            }
        }
    }

    pub(crate) fn add_stanza_listener(
        &self,
        filter: StanzaFilter,
        callback: StanzaCallback,
    ) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.stanza_listeners
            .lock()
            .expect("listener lock poisoned")
            .push(StanzaListener {
                id,
                filter,
                callback,
            });
        id
    }

    pub(crate) fn remove_stanza_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.stanza_listeners.lock().expect("listener lock poisoned");
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub(crate) fn notify_stanza(&self, stanza: &Stanza) {
        let matching: Vec<StanzaCallback> = {
            let listeners = self.stanza_listeners.lock().expect("listener lock poisoned");
            listeners
                .iter()
                .filter(|l| (l.filter)(stanza))
                .map(|l| l.callback.clone())
                .collect()
        };
        for callback in matching {
            if catch_unwind(AssertUnwindSafe(|| callback(stanza))).is_err() {
                warn!("stanza listener panicked; continuing");
            }
        }
    }

    pub(crate) fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(tx) = self.sender() {
            // Best effort; the connection may already be gone.
            let _ = tx.try_send(Command::Disconnect);
        }
    }
}

/// An XMPP client endpoint bound to one account and one server.
///
/// ```no_run
/// # async fn demo() -> xmppc::Result<()> {
/// let config = xmppc::ConnectionConfig::builder()
///     .service_domain("example.com")
///     .username("alice")
///     .password("hunter2")
///     .build()?;
/// let client = xmppc::XmppClient::new(config);
/// client.on_event(|event| println!("{event:?}"));
/// client.run().await
/// # }
/// ```
pub struct XmppClient {
    shared: Arc<Shared>,
}

impl XmppClient {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            shared: Shared::new(config),
        }
    }

    /// Connects and serves the session until it ends. With reconnection
    /// enabled in the configuration, error closes are retried with
    /// exponential backoff; a clean `disconnect()` always ends the loop.
    pub async fn run(&self) -> Result<()> {
        if self.shared.config.keep_alive.reconnection_enabled {
            reconnect::run_supervised(self.shared.clone()).await
        } else {
            connection::run_once(self.shared.clone()).await
        }
    }

    /// The full JID assigned at binding, while a session is active.
    pub fn bound_jid(&self) -> Option<String> {
        self.shared.bound_jid()
    }

    pub async fn send_stanza(&self, stanza: &Stanza) -> Result<()> {
        self.shared.send_raw(stanza.to_xml()).await
    }

    /// Sends an IQ request and awaits its `result`/`error` under the
    /// default 30 s deadline.
    pub async fn send_iq(&self, iq: Iq) -> Result<Iq> {
        self.shared.send_iq(iq, DEFAULT_IQ_TIMEOUT).await
    }

    pub async fn send_iq_with_timeout(&self, iq: Iq, deadline: Duration) -> Result<Iq> {
        self.shared.send_iq(iq, deadline).await
    }

    /// Subscribes to lifecycle events. The callback runs on the
    /// connection's dispatcher task.
    pub fn on_event(
        &self,
        listener: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared.dispatcher.add(listener)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.shared.dispatcher.remove(id)
    }

    /// Registers an async stanza listener with a predicate filter.
    pub fn add_stanza_listener(
        &self,
        filter: impl Fn(&Stanza) -> bool + Send + Sync + 'static,
        callback: impl Fn(&Stanza) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared
            .add_stanza_listener(Arc::new(filter), Arc::new(callback))
    }

    pub fn remove_stanza_listener(&self, id: ListenerId) -> bool {
        self.shared.remove_stanza_listener(id)
    }

    /// Installs a handler for incoming IQ requests whose payload matches
    /// `(name, namespace)` and whose type matches `kind`. The handler's
    /// returned stanza is sent back automatically.
    pub fn set_iq_handler(
        &self,
        name: &str,
        namespace: &str,
        kind: IqKind,
        handler: impl Fn(&Iq) -> Option<Iq> + Send + Sync + 'static,
    ) {
        self.shared
            .handlers
            .set(name, namespace, kind, Arc::new(handler));
    }

    pub fn remove_iq_handler(&self, name: &str, namespace: &str, kind: IqKind) -> bool {
        self.shared.handlers.remove(name, namespace, kind)
    }

    /// Closes the stream gracefully. Pending IQ futures complete with a
    /// cancellation error; no reconnection is attempted.
    pub fn disconnect(&self) {
        self.shared.request_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityMode;

    fn client() -> XmppClient {
        XmppClient::new(
            ConnectionConfig::builder()
                .service_domain("lesswhite")
                .username("acs")
                .password("acs")
                .security_mode(SecurityMode::Disabled)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_send_without_connection_is_a_network_error() {
        let client = client();
        let stanza = Stanza::Presence(crate::stanza::Presence::available());
        assert!(matches!(
            client.send_stanza(&stanza).await,
            Err(Error::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_send_iq_without_connection_cleans_up_pending_entry() {
        let client = client();
        let iq = Iq::get(Ping::to_element()).with_id("p1");
        assert!(client.send_iq(iq).await.is_err());
        assert_eq!(client.shared.correlator.pending_count(), 0);
    }

    #[test]
    fn test_builtin_ping_handler_registered() {
        let client = client();
        let handler = client
            .shared
            .handlers
            .get(Ping::NAME, Ping::NS, IqKind::Get)
            .expect("ping handler missing");
        let request = Iq {
            id: "s1".into(),
            from: Some("example.com".into()),
            to: Some("acs@lesswhite/r".into()),
            kind: IqKind::Get,
            payload: Some(Ping::to_element()),
            error: None,
        };
        let response = handler(&request).expect("ping handler must respond");
        assert_eq!(response.id, "s1");
        assert_eq!(response.kind, IqKind::Result);
        assert_eq!(response.to.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_iq_handler_registry_set_get_remove() {
        let client = client();
        client.set_iq_handler("query", "jabber:iq:version", IqKind::Get, |_| None);
        assert!(client
            .shared
            .handlers
            .get("query", "jabber:iq:version", IqKind::Get)
            .is_some());
        assert!(client.remove_iq_handler("query", "jabber:iq:version", IqKind::Get));
        assert!(!client.remove_iq_handler("query", "jabber:iq:version", IqKind::Get));
    }

    #[test]
    fn test_stanza_listener_filtering() {
        let client = client();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        client.add_stanza_listener(
            |s| matches!(s, Stanza::Message(_)),
            move |s| {
                seen_clone
                    .lock()
                    .unwrap()
                    .push(s.id().unwrap_or("none").to_string());
            },
        );
        client
            .shared
            .notify_stanza(&Stanza::Presence(crate::stanza::Presence::available()));
        let mut message = crate::stanza::Message::chat("a@x", "hi");
        message.id = Some("m1".into());
        client.shared.notify_stanza(&Stanza::Message(message));
        assert_eq!(*seen.lock().unwrap(), vec!["m1"]);
    }
}
