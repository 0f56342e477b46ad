//! Connection parameters.
//!
//! A [`ConnectionConfig`] can be built with the setters, parsed from an AMQP URI (see
//! [`crate::parse_uri`]) or loaded from a TOML file:
//!
//! ```toml
//! hostname = "rabbit.local"
//! username = "app"
//! password = "secret"
//! virtual_host = "/orders"
//! heartbeat = 30
//! ssl = true
//!
//! [ssl_options]
//! ca_certs = "/etc/ssl/rabbit-ca.pem"
//! cert_reqs = "required"
//! ```
use crate::client_error;
use crate::error::ErrorKind;
use anyhow::Result;
use serde_derive::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_TLS_PORT: u16 = 5671;
pub const DEFAULT_HEARTBEAT: u16 = 60;
pub const DEFAULT_TIMEOUT: u64 = 30;
pub const DEFAULT_FRAME_MAX: u32 = 131_072;

/// TLS protocol versions the client can be pinned to.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum TlsVersion {
    #[serde(rename = "tlsv1_2")]
    Tls12,
    #[serde(rename = "tlsv1_3")]
    Tls13,
}

/// How the server certificate is checked.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CertRequirement {
    /// No verification at all.
    #[default]
    None,
    /// Verified when CA certificates are configured.
    Optional,
    /// Always verified, against `ca_certs` or the bundled web PKI roots.
    Required,
}

const TLS_VERSIONS: [(&str, TlsVersion); 2] = [
    ("protocol_tlsv1_2", TlsVersion::Tls12),
    ("protocol_tlsv1_3", TlsVersion::Tls13),
];

const CERT_REQUIREMENTS: [(&str, CertRequirement); 3] = [
    ("cert_none", CertRequirement::None),
    ("cert_optional", CertRequirement::Optional),
    ("cert_required", CertRequirement::Required),
];

/// Find the table entry whose name ends with the lowercased value.
fn match_suffix<T: Copy>(table: &[(&str, T)], value: &str) -> Option<T> {
    if value.is_empty() {
        return None;
    }

    let value = value.to_lowercase();

    table.iter().find(|(name, _)| name.ends_with(&value)).map(|(_, v)| *v)
}

impl TlsVersion {
    /// Look up a version by a name like `PROTOCOL_TLSv1_2` or `tlsv1_3`.
    pub fn lookup(value: &str) -> Option<TlsVersion> {
        match_suffix(&TLS_VERSIONS, value)
    }
}

impl CertRequirement {
    /// Look up a requirement by a name like `CERT_REQUIRED` or `required`.
    pub fn lookup(value: &str) -> Option<CertRequirement> {
        match_suffix(&CERT_REQUIREMENTS, value)
    }
}

/// TLS settings of an `amqps` connection.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlsOptions {
    /// PEM file of the client private key.
    pub keyfile: Option<PathBuf>,
    /// PEM file of the client certificate chain.
    pub certfile: Option<PathBuf>,
    pub cert_reqs: CertRequirement,
    /// `None` lets the TLS library negotiate any version it supports.
    pub ssl_version: Option<TlsVersion>,
    /// PEM file of the trusted CA certificates.
    pub ca_certs: Option<PathBuf>,
}

impl TlsOptions {
    pub fn keyfile<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.keyfile = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn certfile<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.certfile = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn ca_certs<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.ca_certs = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn cert_reqs(mut self, cert_reqs: CertRequirement) -> Self {
        self.cert_reqs = cert_reqs;
        self
    }

    pub fn ssl_version(mut self, version: TlsVersion) -> Self {
        self.ssl_version = Some(version);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.certfile.is_some() != self.keyfile.is_some() {
            return client_error!(
                ErrorKind::Configuration,
                None,
                0,
                "ssl_options: certfile and keyfile must be given together",
                0
            );
        }

        if self.cert_reqs == CertRequirement::Optional && self.ca_certs.is_none() {
            log::warn!("ssl_options: cert_reqs is optional without ca_certs, the server is not verified");
        }

        Ok(())
    }
}

/// Parameters of a connection.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
    /// Default depends on `ssl`, see [`ConnectionConfig::port_or_default`].
    pub port: Option<u16>,
    pub virtual_host: String,
    /// Heartbeat interval in seconds, 0 leaves the choice to the server.
    pub heartbeat: u16,
    /// Timeout of connecting and of the synchronous calls, in seconds.
    pub timeout: u64,
    /// Channel limit proposed to the server, 0 means no preference.
    pub channel_max: u16,
    /// Frame size limit proposed to the server, 0 means no preference.
    pub frame_max: u32,
    pub ssl: bool,
    pub ssl_options: TlsOptions,
    /// Don't connect on construction, only on an explicit `open()`.
    pub lazy: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            port: None,
            virtual_host: "/".to_string(),
            heartbeat: DEFAULT_HEARTBEAT,
            timeout: DEFAULT_TIMEOUT,
            channel_max: 0,
            frame_max: DEFAULT_FRAME_MAX,
            ssl: false,
            ssl_options: TlsOptions::default(),
            lazy: false,
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: &str, username: &str, password: &str) -> Self {
        ConnectionConfig {
            hostname: hostname.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            ..Default::default()
        }
    }

    /// Parse an `amqp://` or `amqps://` URI.
    pub fn from_uri(uri: &str) -> Result<Self> {
        crate::uri::parse_uri(uri)
    }

    /// Parse the TOML representation of the config.
    pub fn from_toml(content: &str) -> Result<Self> {
        match toml::from_str(content) {
            Ok(config) => Ok(config),
            Err(e) => client_error!(ErrorKind::Configuration, None, 0, e.to_string(), 0),
        }
    }

    /// Load the config from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        Self::from_toml(&content)
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn virtual_host(mut self, virtual_host: &str) -> Self {
        self.virtual_host = virtual_host.to_string();
        self
    }

    pub fn heartbeat(mut self, seconds: u16) -> Self {
        self.heartbeat = seconds;
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    pub fn frame_max(mut self, frame_max: u32) -> Self {
        self.frame_max = frame_max;
        self
    }

    /// Connect with TLS.
    pub fn ssl(mut self, options: TlsOptions) -> Self {
        self.ssl = true;
        self.ssl_options = options;
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn port_or_default(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None if self.ssl => DEFAULT_TLS_PORT,
            None => DEFAULT_PORT,
        }
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return client_error!(ErrorKind::Configuration, None, 0, "hostname is empty", 0);
        }

        if self.timeout == 0 {
            return client_error!(ErrorKind::Configuration, None, 0, "timeout must be positive", 0);
        }

        if self.ssl {
            self.ssl_options.validate()?;
        }

        Ok(())
    }
}
