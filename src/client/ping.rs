/// XEP-0199 keep-alive supervisor.
///
/// Spawned when the session reaches `Authenticated`, aborted on any
/// close. Every interval it sends an IQ-get ping to the service domain
/// through the correlator and ignores the answer; failures are logged at
/// warn level. The inbound half of XEP-0199 (answering server pings) is
/// the built-in handler registered in [`super::Shared::new`].
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::client::{Shared, DEFAULT_IQ_TIMEOUT};
use crate::stanza::registry::Ping;
use crate::stanza::Iq;

pub(crate) fn spawn(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(shared.config.ping_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the ping cadence starts
        // one interval after activation.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if shared.bound_jid().is_none() {
                break;
            }
            let iq = Iq::get(Ping::to_element())
                .with_to(shared.config.connection.service_domain.clone());
            match shared.send_iq(iq, DEFAULT_IQ_TIMEOUT).await {
                Ok(_) => debug!("keep-alive ping answered"),
                Err(e) => warn!("keep-alive ping failed: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Command;
    use crate::config::{ConnectionConfig, SecurityMode};
    use crate::stanza::IqKind;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn shared() -> Arc<Shared> {
        Shared::new(
            ConnectionConfig::builder()
                .service_domain("lesswhite")
                .username("acs")
                .password("acs")
                .security_mode(SecurityMode::Disabled)
                .ping_enabled(true)
                .ping_interval(Duration::from_secs(60))
                .build()
                .unwrap(),
        )
    }

    fn answer(shared: &Shared, xml: &str) {
        let id = xml
            .split("id='")
            .nth(1)
            .and_then(|s| s.split('\'').next())
            .expect("ping without id")
            .to_string();
        assert!(shared.correlator.complete(&Iq {
            id,
            from: Some("lesswhite".into()),
            to: None,
            kind: IqKind::Result,
            payload: None,
            error: None,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ping_to_service_domain() {
        let shared = shared();
        let (tx, mut rx) = mpsc::channel(16);
        shared.install_sender(tx);
        shared.set_bound_jid("acs@lesswhite/work".into());

        let task = spawn(shared.clone());

        let Some(Command::Send(first)) = rx.recv().await else {
            panic!("expected a ping command");
        };
        assert!(first.contains("urn:xmpp:ping"));
        assert!(first.contains("to='lesswhite'"));
        assert!(first.contains("type='get'"));
        answer(&shared, &first);

        let Some(Command::Send(second)) = rx.recv().await else {
            panic!("expected a second ping");
        };
        assert!(second.contains("urn:xmpp:ping"));

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_stops_after_session_ends() {
        let shared = shared();
        let (tx, mut rx) = mpsc::channel(16);
        shared.install_sender(tx);
        shared.set_bound_jid("acs@lesswhite/work".into());

        let task = spawn(shared.clone());
        let Some(Command::Send(first)) = rx.recv().await else {
            panic!("expected a ping command");
        };
        answer(&shared, &first);

        // Session ends; the next tick must terminate the task.
        shared.clear_session();
        task.await.expect("ping task should exit cleanly");
    }
}
