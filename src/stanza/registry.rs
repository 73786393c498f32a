/// Process-wide provider registry.
///
/// Maps `(element_name, namespace)` to a decoder that turns the generic
/// element tree into a typed payload. Elements without a provider stay
/// generic, so registration is an optimization for callers that want typed
/// access, never a requirement for dispatch. Reads are lock-free in the
/// steady state; registration replaces an existing provider only at equal
/// or higher priority.
use std::any::Any;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::xml::{namespaces, Element};

pub trait Provider: Send + Sync {
    fn element_name(&self) -> &'static str;
    fn namespace(&self) -> &'static str;
    fn priority(&self) -> i32 {
        0
    }
    /// Decodes the element into the provider's payload type.
    fn decode(&self, element: &Element) -> Result<Box<dyn Any + Send>>;
}

pub struct ProviderRegistry {
    map: DashMap<(String, String), (i32, Arc<dyn Provider>)>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// The shared registry with the built-in `bind` and `ping` providers.
    pub fn global() -> &'static ProviderRegistry {
        static GLOBAL: OnceLock<ProviderRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let registry = ProviderRegistry::new();
            registry.register(Arc::new(BindProvider));
            registry.register(Arc::new(PingProvider));
            registry
        })
    }

    /// Returns false when an existing higher-priority registration wins.
    pub fn register(&self, provider: Arc<dyn Provider>) -> bool {
        let key = (
            provider.element_name().to_string(),
            provider.namespace().to_string(),
        );
        let priority = provider.priority();
        match self.map.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if priority >= slot.get().0 {
                    slot.insert((priority, provider));
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert((priority, provider));
                true
            }
        }
    }

    pub fn get(&self, name: &str, namespace: &str) -> Option<Arc<dyn Provider>> {
        self.map
            .get(&(name.to_string(), namespace.to_string()))
            .map(|entry| entry.value().1.clone())
    }

    /// Looks up and decodes in one step; `None` when no provider is
    /// registered or the payload is of a different type.
    pub fn decode<T: 'static>(&self, element: &Element) -> Option<T> {
        let provider = self.get(&element.name, &element.namespace)?;
        let payload = provider.decode(element).ok()?;
        payload.downcast::<T>().ok().map(|boxed| *boxed)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── bind (RFC 6120 §7) ───────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bind {
    pub jid: Option<String>,
    pub resource: Option<String>,
}

impl Bind {
    pub const NAME: &'static str = "bind";
    pub const NS: &'static str = namespaces::BIND;

    /// The `<bind/>` request payload, with the optional preferred resource.
    pub fn request(resource: Option<&str>) -> Element {
        let el = Element::new(Self::NAME, Self::NS);
        match resource {
            Some(r) if !r.is_empty() => {
                el.with_child(Element::new("resource", Self::NS).with_text(r))
            }
            _ => el,
        }
    }

    pub fn from_element(element: &Element) -> Result<Self> {
        if element.name != Self::NAME || element.namespace != Self::NS {
            return Err(Error::Parse(format!(
                "expected <bind>, got <{}>",
                element.name
            )));
        }
        Ok(Self {
            jid: element.child("jid", Self::NS).map(|c| c.text()),
            resource: element.child("resource", Self::NS).map(|c| c.text()),
        })
    }
}

struct BindProvider;

impl Provider for BindProvider {
    fn element_name(&self) -> &'static str {
        Bind::NAME
    }
    fn namespace(&self) -> &'static str {
        Bind::NS
    }
    fn decode(&self, element: &Element) -> Result<Box<dyn Any + Send>> {
        Ok(Box::new(Bind::from_element(element)?))
    }
}

// ── ping (XEP-0199) ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Ping;

impl Ping {
    pub const NAME: &'static str = "ping";
    pub const NS: &'static str = namespaces::PING;

    pub fn to_element() -> Element {
        Element::new(Self::NAME, Self::NS)
    }
}

struct PingProvider;

impl Provider for PingProvider {
    fn element_name(&self) -> &'static str {
        Ping::NAME
    }
    fn namespace(&self) -> &'static str {
        Ping::NS
    }
    fn decode(&self, element: &Element) -> Result<Box<dyn Any + Send>> {
        if element.name != Ping::NAME || element.namespace != Ping::NS {
            return Err(Error::Parse("not a ping".into()));
        }
        Ok(Box::new(Ping))
    }
}
