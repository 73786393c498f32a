/// Matches incoming IQ responses to pending requests by stanza id.
///
/// Each `register` hands back a oneshot receiver; the connection's
/// dispatcher task completes it with the first `result` or `error` IQ
/// carrying the same id. Entries are removed on completion, on deadline
/// (the caller removes before reporting a timeout, so late arrivals are
/// dropped silently), and on connection close (everything cancels).
use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::stanza::Iq;

pub struct Correlator {
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Iq>>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a pending request. The id must be non-empty and not
    /// already in flight.
    pub fn register(&self, id: &str) -> Result<oneshot::Receiver<Result<Iq>>> {
        if id.is_empty() {
            return Err(Error::Protocol(
                "an IQ request must carry a non-empty id".into(),
            ));
        }
        let mut pending = self.pending.lock().expect("correlator lock poisoned");
        if pending.contains_key(id) {
            return Err(Error::Protocol(format!(
                "an IQ request with id '{id}' is already pending"
            )));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Offers an incoming IQ. Returns true when it completed a pending
    /// request (and was therefore consumed).
    pub fn complete(&self, iq: &Iq) -> bool {
        if !iq.kind.is_response() {
            return false;
        }
        let sender = {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            pending.remove(&iq.id)
        };
        match sender {
            Some(tx) => {
                // A dropped receiver means the caller timed out already.
                let _ = tx.send(Ok(iq.clone()));
                true
            }
            None => false,
        }
    }

    /// Drops a pending entry, typically when its deadline fired.
    pub fn remove(&self, id: &str) -> bool {
        self.pending
            .lock()
            .expect("correlator lock poisoned")
            .remove(id)
            .is_some()
    }

    /// Completes every remaining future with a cancellation error.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::Cancelled));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("correlator lock poisoned").len()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}
