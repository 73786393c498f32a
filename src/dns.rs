/// DNS SRV resolution (RFC 2782) and connect-target selection.
///
/// Targets are tried in a fixed order: an explicit IP address from the
/// configuration wins, then an explicit hostname, then the
/// `_xmpp-client._tcp` SRV records, and finally the service domain itself
/// on the conventional port.
///
/// Within the SRV result we sort by ascending priority and, inside one
/// priority class, by descending weight. RFC 2782 prescribes a
/// weighted-random pick instead; the deterministic sort is kept on purpose
/// so target iteration is reproducible, at the cost of ignoring the
/// load-spreading intent of equal-priority weights.
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// One host/port pair the connect loop will try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Looks up `_xmpp-client._tcp.<service_domain>`. An empty result (name
/// does not exist, or exists without SRV records) asks the caller to fall
/// back to the service domain itself; any other lookup failure is fatal.
pub async fn lookup_srv(service_domain: &str) -> Result<Vec<SrvRecord>> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|e| Error::Network(format!("cannot build system resolver: {e}")))?;

    let name = format!("_xmpp-client._tcp.{service_domain}.");
    debug!("SRV lookup for {name}");
    match resolver.srv_lookup(name).await {
        Ok(lookup) => {
            let mut records: Vec<SrvRecord> = lookup
                .iter()
                .map(|srv| SrvRecord {
                    target: strip_trailing_dot(&srv.target().to_utf8()),
                    port: srv.port(),
                    priority: srv.priority(),
                    weight: srv.weight(),
                })
                .collect();
            sort_records(&mut records);
            Ok(records)
        }
        Err(e) => match e.kind() {
            ResolveErrorKind::NoRecordsFound { response_code, .. }
                if matches!(
                    *response_code,
                    ResponseCode::NXDomain | ResponseCode::NoError
                ) =>
            {
                Ok(Vec::new())
            }
            _ => Err(Error::Network(format!("SRV lookup failed: {e}"))),
        },
    }
}

/// Priority ascending, then weight descending within a priority class.
pub fn sort_records(records: &mut [SrvRecord]) {
    records.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.weight.cmp(&a.weight))
    });
}

fn strip_trailing_dot(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_string()
}

/// Builds the ordered target list for the connect loop.
pub async fn resolve_targets(config: &ConnectionConfig) -> Result<Vec<Target>> {
    if let Some(ip) = config.connection.ip_address {
        return Ok(vec![Target {
            host: ip.to_string(),
            port: config.port(),
        }]);
    }
    if let Some(host) = &config.connection.host {
        return Ok(vec![Target {
            host: host.clone(),
            port: config.port(),
        }]);
    }

    let records = lookup_srv(&config.connection.service_domain).await?;
    if !records.is_empty() {
        return Ok(records
            .into_iter()
            .map(|r| Target {
                host: r.target,
                port: r.port,
            })
            .collect());
    }

    Ok(vec![Target {
        host: config.connection.service_domain.clone(),
        port: config.port(),
    }])
}
