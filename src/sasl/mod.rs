/// SASL client mechanisms and the selection algorithm.
///
/// A mechanism is a stateful challenge/response object working on raw
/// bytes; Base64 framing belongs to the stanza layer. The registry of
/// available mechanisms is process-wide, ordered by priority, and gates
/// PLAIN on a TLS-protected transport unless the configuration explicitly
/// permits otherwise.
pub mod plain;
pub mod scram;

pub use plain::Plain;
pub use scram::{ScramSha1, ScramSha256, ScramSha512};

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub trait Mechanism: Send {
    fn name(&self) -> &'static str;

    /// Whether the `<auth/>` element carries an initial response.
    fn has_initial_response(&self) -> bool {
        true
    }

    /// The initial response bytes (empty when `has_initial_response` is
    /// false).
    fn initial(&mut self) -> Result<Vec<u8>>;

    /// Consumes a server challenge and produces the next response.
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;

    /// Consumes the `<success/>` content (if any) for final verification.
    /// Completes the mechanism; key material is wiped on return.
    fn verify_success(&mut self, data: Option<&[u8]>) -> Result<()>;

    fn is_complete(&self) -> bool;
}

/// Everything a mechanism factory needs to build an instance.
pub struct SaslContext {
    pub username: String,
    pub password: Zeroizing<Vec<u8>>,
    /// Authorization identity; only PLAIN carries it (the SCRAM GS2
    /// header is fixed to `n,,`).
    pub authzid: Option<String>,
    /// Server-advertised SCRAM iteration counts below this fail hard.
    pub min_scram_iterations: u32,
}

type Factory = Arc<dyn Fn(&SaslContext) -> Box<dyn Mechanism> + Send + Sync>;

struct MechanismEntry {
    priority: i32,
    /// Only selectable on a TLS-protected transport (or when the
    /// configuration explicitly allows plaintext credentials).
    tls_only: bool,
    factory: Factory,
}

/// Priority-ordered, occasionally-mutated mechanism registry.
pub struct MechanismRegistry {
    map: DashMap<String, MechanismEntry>,
}

impl MechanismRegistry {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// The shared registry with the built-in SCRAM family and PLAIN.
    pub fn global() -> &'static MechanismRegistry {
        static GLOBAL: OnceLock<MechanismRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let registry = MechanismRegistry::new();
            registry.register("SCRAM-SHA-512", 60, false, |ctx| {
                Box::new(ScramSha512::new(ctx))
            });
            registry.register("SCRAM-SHA-256", 50, false, |ctx| {
                Box::new(ScramSha256::new(ctx))
            });
            registry.register("SCRAM-SHA-1", 40, false, |ctx| {
                Box::new(ScramSha1::new(ctx))
            });
            registry.register("PLAIN", 10, true, |ctx| Box::new(Plain::new(ctx)));
            registry
        })
    }

    pub fn register(
        &self,
        name: &str,
        priority: i32,
        tls_only: bool,
        factory: impl Fn(&SaslContext) -> Box<dyn Mechanism> + Send + Sync + 'static,
    ) {
        self.map.insert(
            name.to_string(),
            MechanismEntry {
                priority,
                tls_only,
                factory: Arc::new(factory),
            },
        );
    }

    /// Picks the highest-priority mechanism from the intersection of the
    /// server-offered names, the configuration filter (when present), and
    /// the locally registered mechanisms. Unsupported names are skipped.
    pub fn select(
        &self,
        offered: &[String],
        enabled: Option<&[String]>,
        tls_active: bool,
        allow_plain_without_tls: bool,
    ) -> Option<String> {
        let mut best: Option<(i32, String)> = None;
        for name in offered {
            if let Some(filter) = enabled {
                if !filter.iter().any(|f| f == name) {
                    continue;
                }
            }
            let Some(entry) = self.map.get(name) else {
                continue;
            };
            if entry.tls_only && !tls_active && !allow_plain_without_tls {
                continue;
            }
            if best.as_ref().map_or(true, |(p, _)| entry.priority > *p) {
                best = Some((entry.priority, name.clone()));
            }
        }
        best.map(|(_, name)| name)
    }

    pub fn create(&self, name: &str, ctx: &SaslContext) -> Result<Box<dyn Mechanism>> {
        let entry = self
            .map
            .get(name)
            .ok_or_else(|| Error::Auth(format!("unsupported SASL mechanism {name}")))?;
        Ok((entry.factory)(ctx))
    }
}

impl Default for MechanismRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn test_context(username: &str, password: &str) -> SaslContext {
    SaslContext {
        username: username.to_string(),
        password: Zeroizing::new(password.as_bytes().to_vec()),
        authzid: None,
        min_scram_iterations: 4096,
    }
}
