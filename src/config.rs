/// Immutable connection configuration.
///
/// Built once through [`ConnectionConfigBuilder`] (or loaded from a TOML
/// file with `${ENV_VAR}` substitution) and then frozen. The password is
/// held as a mutable byte buffer behind a lock so the client can wipe it
/// after an authentication failure without tearing the whole record down.
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 5222;
pub const DEFAULT_DIRECT_TLS_PORT: u16 = 5223;

#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    pub connection: ConnectionSettings,
    pub auth: AuthSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub keep_alive: KeepAliveSettings,
    #[serde(default)]
    pub locale: LocaleSettings,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionSettings {
    /// The XMPP service domain, e.g. `example.com`. Required; also used
    /// for SNI and the stream header `to` attribute.
    pub service_domain: String,
    /// Overrides DNS SRV resolution with a fixed hostname.
    #[serde(default)]
    pub host: Option<String>,
    /// Skips DNS entirely.
    #[serde(default)]
    pub ip_address: Option<IpAddr>,
    /// Defaults to 5222, or 5223 when direct TLS is enabled.
    #[serde(default)]
    pub port: Option<u16>,
    /// Preferred resource for binding; the server picks one if absent.
    #[serde(default)]
    pub resource: Option<String>,
    /// Intersection filter over the locally supported SASL mechanisms.
    #[serde(default)]
    pub enabled_sasl_mechanisms: Option<Vec<String>>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Send `<presence/>` right after binding.
    #[serde(default = "default_true")]
    pub send_presence: bool,
}

#[derive(Deserialize)]
pub struct AuthSettings {
    pub username: String,
    /// Supports ${ENV_VAR} substitution when loaded from a file.
    pub password: Secret,
    #[serde(default)]
    pub authzid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Refuse to authenticate unless the transport is TLS-protected.
    #[default]
    Required,
    /// Upgrade when the server offers STARTTLS, continue otherwise.
    IfPossible,
    /// Never negotiate TLS.
    Disabled,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    pub mode: SecurityMode,
    /// TLS from the first byte on a dedicated port.
    pub direct_tls: bool,
    pub hostname_verification: bool,
    pub handshake_timeout_ms: u64,
    /// Extra trust roots, PEM file.
    pub trust_roots_pem: Option<PathBuf>,
    /// Client key material, PKCS#12 archive.
    pub identity_p12: Option<PathBuf>,
    pub identity_password: Option<String>,
    /// Lowest acceptable protocol version, e.g. "1.2".
    pub min_tls_version: Option<String>,
    /// Permit PLAIN on a plaintext transport. Off by default.
    pub allow_plain_without_tls: bool,
    /// Promotes the SCRAM iteration-count warning to a hard failure when
    /// the server advertises fewer rounds than this.
    pub min_scram_iterations: u32,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            mode: SecurityMode::default(),
            direct_tls: false,
            hostname_verification: true,
            handshake_timeout_ms: 10_000,
            trust_roots_pem: None,
            identity_p12: None,
            identity_password: None,
            min_tls_version: None,
            allow_plain_without_tls: false,
            min_scram_iterations: 4096,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct KeepAliveSettings {
    pub reconnection_enabled: bool,
    pub reconnection_base_delay_secs: u64,
    pub reconnection_max_delay_secs: u64,
    pub ping_enabled: bool,
    pub ping_interval_secs: u64,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            reconnection_enabled: false,
            reconnection_base_delay_secs: 2,
            reconnection_max_delay_secs: 60,
            ping_enabled: false,
            ping_interval_secs: 60,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LocaleSettings {
    /// BCP 47 tag emitted as `xml:lang` on the stream header.
    pub language: Option<String>,
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_read_timeout_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Loads a TOML file, expanding `${ENV_VAR}` references first, the
    /// same way the reference front-end does.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {path}: {e}")))?;
        let expanded = shellexpand::env(&content)
            .map_err(|e| Error::Config(format!("bad environment reference in {path}: {e}")))?;
        let config: ConnectionConfig = toml::from_str(&expanded)
            .map_err(|e| Error::Config(format!("invalid configuration in {path}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.connection.service_domain.trim().is_empty() {
            return Err(Error::Config("service_domain must not be empty".into()));
        }
        if self.auth.username.trim().is_empty() {
            return Err(Error::Config("username must not be empty".into()));
        }
        if self.connection.port == Some(0) {
            return Err(Error::Config("port 0 is not connectable".into()));
        }
        Ok(())
    }

    /// The configured port, or the conventional default for the transport.
    pub fn port(&self) -> u16 {
        self.connection.port.unwrap_or(if self.security.direct_tls {
            DEFAULT_DIRECT_TLS_PORT
        } else {
            DEFAULT_PORT
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.read_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.security.handshake_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive.ping_interval_secs)
    }

    /// The stream language, unless it is the undefined tag.
    pub fn language(&self) -> Option<&str> {
        match self.locale.language.as_deref() {
            Some("") | Some("und") | None => None,
            lang => lang,
        }
    }
}

// ── password secret ──────────────────────────────────────

/// A mutable byte buffer holding the password. Interior mutability lets
/// the owning (frozen, shared) configuration zero it after use; reads
/// clone into a self-zeroing guard. Never printed by Debug.
pub struct Secret {
    inner: Mutex<Zeroizing<Vec<u8>>>,
}

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Mutex::new(Zeroizing::new(bytes.into())),
        }
    }

    pub fn reveal(&self) -> Zeroizing<Vec<u8>> {
        self.inner.lock().expect("secret lock poisoned").clone()
    }

    /// Overwrites the buffer with zeroes.
    pub fn clear(&self) {
        self.inner.lock().expect("secret lock poisoned").zeroize();
    }

    pub fn is_cleared(&self) -> bool {
        self.inner
            .lock()
            .expect("secret lock poisoned")
            .iter()
            .all(|&b| b == 0)
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Secret::new(s.into_bytes()))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("username", &self.username)
            .field("password", &self.password)
            .field("authzid", &self.authzid)
            .finish()
    }
}

// ── builder ──────────────────────────────────────────────

/// Builds a frozen [`ConnectionConfig`], refusing illegal partial states
/// at `build()` time.
#[derive(Default)]
pub struct ConnectionConfigBuilder {
    service_domain: Option<String>,
    host: Option<String>,
    ip_address: Option<IpAddr>,
    port: Option<u16>,
    resource: Option<String>,
    enabled_sasl_mechanisms: Option<Vec<String>>,
    connect_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    send_presence: Option<bool>,
    username: Option<String>,
    password: Option<Vec<u8>>,
    authzid: Option<String>,
    security: SecuritySettings,
    keep_alive: KeepAliveSettings,
    language: Option<String>,
}

impl ConnectionConfigBuilder {
    pub fn service_domain(mut self, domain: impl Into<String>) -> Self {
        self.service_domain = Some(domain.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn ip_address(mut self, ip: IpAddr) -> Self {
        self.ip_address = Some(ip);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn enabled_sasl_mechanisms(
        mut self,
        mechanisms: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.enabled_sasl_mechanisms =
            Some(mechanisms.into_iter().map(Into::into).collect());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn send_presence(mut self, send: bool) -> Self {
        self.send_presence = Some(send);
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn authzid(mut self, authzid: impl Into<String>) -> Self {
        self.authzid = Some(authzid.into());
        self
    }

    pub fn security_mode(mut self, mode: SecurityMode) -> Self {
        self.security.mode = mode;
        self
    }

    pub fn direct_tls(mut self, direct: bool) -> Self {
        self.security.direct_tls = direct;
        self
    }

    pub fn hostname_verification(mut self, verify: bool) -> Self {
        self.security.hostname_verification = verify;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.security.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn trust_roots_pem(mut self, path: impl Into<PathBuf>) -> Self {
        self.security.trust_roots_pem = Some(path.into());
        self
    }

    pub fn allow_plain_without_tls(mut self, allow: bool) -> Self {
        self.security.allow_plain_without_tls = allow;
        self
    }

    pub fn min_scram_iterations(mut self, floor: u32) -> Self {
        self.security.min_scram_iterations = floor;
        self
    }

    pub fn reconnection_enabled(mut self, enabled: bool) -> Self {
        self.keep_alive.reconnection_enabled = enabled;
        self
    }

    pub fn ping_enabled(mut self, enabled: bool) -> Self {
        self.keep_alive.ping_enabled = enabled;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.keep_alive.ping_interval_secs = interval.as_secs();
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn build(self) -> Result<ConnectionConfig> {
        let service_domain = self
            .service_domain
            .ok_or_else(|| Error::Config("service_domain is required".into()))?;
        let username = self
            .username
            .ok_or_else(|| Error::Config("username is required".into()))?;
        let password = self
            .password
            .ok_or_else(|| Error::Config("password is required".into()))?;

        let config = ConnectionConfig {
            connection: ConnectionSettings {
                service_domain,
                host: self.host,
                ip_address: self.ip_address,
                port: self.port,
                resource: self.resource,
                enabled_sasl_mechanisms: self.enabled_sasl_mechanisms,
                connect_timeout_ms: self
                    .connect_timeout_ms
                    .unwrap_or_else(default_connect_timeout_ms),
                read_timeout_ms: self.read_timeout_ms.unwrap_or_else(default_read_timeout_ms),
                send_presence: self.send_presence.unwrap_or(true),
            },
            auth: AuthSettings {
                username,
                password: Secret::new(password),
                authzid: self.authzid,
            },
            security: self.security,
            keep_alive: self.keep_alive,
            locale: LocaleSettings {
                language: self.language,
            },
        };
        config.validate()?;
        Ok(config)
    }
}
