//! Caster connection parameters.
//!
//! [`ClientConfig`] is built once through [`ClientConfigBuilder`] and is
//! read-only afterwards. All invariants are checked in
//! [`ClientConfigBuilder::build`], so a `ClientConfig` value is always valid.

use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Default values used when the caller does not override a setting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NtripDefaults;

impl NtripDefaults {
    pub const PORT: u16 = 2101;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_HEADER_BYTES: usize = 16 * 1024;
    pub const READ_BUFFER_SIZE: usize = 4096;
    pub const USER_AGENT: &'static str = concat!("NTRIP ntrip-client/", env!("CARGO_PKG_VERSION"));
    /// Greeting sent by version 1 casters before raw data starts.
    pub const V1_GREETING: &'static str = "ICY 200 OK";
}

/// NTRIP protocol revision used for the handshake.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum NtripVersion {
    V1,
    #[default]
    V2,
}

impl NtripVersion {
    /// Parses the numeric form used on the command line and in profiles.
    pub fn from_number(value: u8) -> Result<Self, ConfigError> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(ConfigError::UnsupportedVersion(other)),
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

impl fmt::Display for NtripVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ntrip/{}.0", self.number())
    }
}

/// Invalid connection parameters.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("host must not be empty")]
    EmptyHost,

    #[error("mountpoint must not be empty")]
    EmptyMountpoint,

    #[error("mountpoint {0:?} contains whitespace or control characters")]
    InvalidMountpoint(String),

    #[error("port must be in 1..=65535")]
    InvalidPort,

    #[error("unsupported NTRIP version {0} (expected 1 or 2)")]
    UnsupportedVersion(u8),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("version 1 greeting allow-list must contain at least one non-empty token")]
    EmptyGreetings,
}

/// Immutable, validated connection parameters for one caster mountpoint.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    host: String,
    port: u16,
    mountpoint: String,
    username: Option<String>,
    password: Option<SecretString>,
    use_tls: bool,
    version: NtripVersion,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    max_header_bytes: usize,
    read_buffer_size: usize,
    user_agent: String,
    v1_greetings: Vec<String>,
}

impl ClientConfig {
    /// Starts a builder for `host` and `mountpoint` with every other setting
    /// at its default.
    pub fn builder(host: impl Into<String>, mountpoint: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(host, mountpoint)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Mountpoint without the leading slash.
    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some()
    }

    pub fn use_tls(&self) -> bool {
        self.use_tls
    }

    pub fn version(&self) -> NtripVersion {
        self.version
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn max_header_bytes(&self) -> usize {
        self.max_header_bytes
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn v1_greetings(&self) -> &[String] {
        &self.v1_greetings
    }

    /// `username:password` as sent in the Basic authorization header.
    ///
    /// A missing password is encoded as an empty string.
    pub(crate) fn basic_credentials(&self) -> Option<String> {
        let username = self.username.as_deref()?;
        let password = self
            .password
            .as_ref()
            .map(|secret| secret.expose_secret().as_str())
            .unwrap_or("");
        Some(format!("{username}:{password}"))
    }
}

/// Builder for [`ClientConfig`].
#[derive(Clone, Debug)]
pub struct ClientConfigBuilder {
    host: String,
    port: u32,
    mountpoint: String,
    username: Option<String>,
    password: Option<SecretString>,
    use_tls: bool,
    version: NtripVersion,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    max_header_bytes: usize,
    read_buffer_size: usize,
    user_agent: String,
    v1_greetings: Vec<String>,
}

impl ClientConfigBuilder {
    pub fn new(host: impl Into<String>, mountpoint: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: u32::from(NtripDefaults::PORT),
            mountpoint: mountpoint.into(),
            username: None,
            password: None,
            use_tls: false,
            version: NtripVersion::default(),
            connect_timeout: NtripDefaults::CONNECT_TIMEOUT,
            handshake_timeout: NtripDefaults::HANDSHAKE_TIMEOUT,
            max_header_bytes: NtripDefaults::MAX_HEADER_BYTES,
            read_buffer_size: NtripDefaults::READ_BUFFER_SIZE,
            user_agent: NtripDefaults::USER_AGENT.to_string(),
            v1_greetings: vec![NtripDefaults::V1_GREETING.to_string()],
        }
    }

    /// Sets the caster port.
    ///
    /// Takes a wide integer so out-of-range values from user input are
    /// reported by [`build`](Self::build) instead of being truncated.
    pub fn port(mut self, port: u32) -> Self {
        self.port = port;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: Option<SecretString>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn version(mut self, version: NtripVersion) -> Self {
        self.version = version;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn max_header_bytes(mut self, limit: usize) -> Self {
        self.max_header_bytes = limit;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Replaces the version 1 greeting allow-list.
    pub fn v1_greetings<I, S>(mut self, greetings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.v1_greetings = greetings.into_iter().map(Into::into).collect();
        self
    }

    /// Adds one token to the version 1 greeting allow-list.
    pub fn accept_v1_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.v1_greetings.push(greeting.into());
        self
    }

    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let host = self.host.trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        let mountpoint = self.mountpoint.trim().trim_start_matches('/').to_string();
        if mountpoint.is_empty() {
            return Err(ConfigError::EmptyMountpoint);
        }
        if mountpoint
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(ConfigError::InvalidMountpoint(mountpoint));
        }

        let port = u16::try_from(self.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or(ConfigError::InvalidPort)?;

        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Zero("connect_timeout"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::Zero("handshake_timeout"));
        }
        if self.max_header_bytes == 0 {
            return Err(ConfigError::Zero("max_header_bytes"));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Zero("read_buffer_size"));
        }

        let v1_greetings: Vec<String> = self
            .v1_greetings
            .into_iter()
            .map(|greeting| greeting.trim().to_string())
            .filter(|greeting| !greeting.is_empty())
            .collect();
        if v1_greetings.is_empty() {
            return Err(ConfigError::EmptyGreetings);
        }

        Ok(ClientConfig {
            host,
            port,
            mountpoint,
            username: self.username.filter(|name| !name.is_empty()),
            password: self.password,
            use_tls: self.use_tls,
            version: self.version,
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            max_header_bytes: self.max_header_bytes,
            read_buffer_size: self.read_buffer_size,
            user_agent: self.user_agent,
            v1_greetings,
        })
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{ClientConfig, ConfigError, NtripDefaults, NtripVersion};

    #[test]
    fn defaults_match_caster_conventions() {
        let config = ClientConfig::builder("caster.example.org", "RTCM3")
            .build()
            .expect("valid config");

        assert_eq!(config.port(), 2101);
        assert_eq!(config.version(), NtripVersion::V2);
        assert!(!config.use_tls());
        assert!(!config.has_credentials());
        assert_eq!(config.v1_greetings(), ["ICY 200 OK".to_string()]);
        assert_eq!(config.read_buffer_size(), NtripDefaults::READ_BUFFER_SIZE);
        assert!(config.user_agent().starts_with("NTRIP "));
    }

    #[test]
    fn leading_slash_is_stripped_from_mountpoint() {
        let config = ClientConfig::builder("caster", "/MOUNT")
            .build()
            .expect("valid config");
        assert_eq!(config.mountpoint(), "MOUNT");
    }

    #[test]
    fn rejects_empty_mountpoint() {
        let err = ClientConfig::builder("caster", "/").build().unwrap_err();
        assert_eq!(err, ConfigError::EmptyMountpoint);
    }

    #[test]
    fn rejects_mountpoint_with_line_break() {
        let err = ClientConfig::builder("caster", "RTCM\r\nX-Injected: 1")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMountpoint(_)));
    }

    #[test]
    fn rejects_out_of_range_ports() {
        for port in [0, 65_536, 100_000] {
            let err = ClientConfig::builder("caster", "M").port(port).build().unwrap_err();
            assert_eq!(err, ConfigError::InvalidPort, "port {port}");
        }
        assert!(ClientConfig::builder("caster", "M").port(65_535).build().is_ok());
    }

    #[test]
    fn rejects_empty_host_and_greetings() {
        assert_eq!(
            ClientConfig::builder("  ", "M").build().unwrap_err(),
            ConfigError::EmptyHost
        );
        assert_eq!(
            ClientConfig::builder("caster", "M")
                .v1_greetings(["", "  "])
                .build()
                .unwrap_err(),
            ConfigError::EmptyGreetings
        );
    }

    #[test]
    fn version_numbers_round_trip_and_reject_unknown() {
        assert_eq!(NtripVersion::from_number(1), Ok(NtripVersion::V1));
        assert_eq!(NtripVersion::from_number(2), Ok(NtripVersion::V2));
        assert_eq!(
            NtripVersion::from_number(3),
            Err(ConfigError::UnsupportedVersion(3))
        );
        assert_eq!(NtripVersion::V2.to_string(), "Ntrip/2.0");
    }

    #[test]
    fn credentials_default_to_empty_password() {
        let config = ClientConfig::builder("caster", "M")
            .credentials("user", None)
            .build()
            .expect("valid config");
        assert_eq!(config.basic_credentials().as_deref(), Some("user:"));

        let config = ClientConfig::builder("caster", "M")
            .credentials("user", Some(SecretString::new("secret".to_string())))
            .build()
            .expect("valid config");
        assert_eq!(config.basic_credentials().as_deref(), Some("user:secret"));
    }

    #[test]
    fn debug_output_redacts_password() {
        let config = ClientConfig::builder("caster", "M")
            .credentials("user", Some(SecretString::new("hunter2".to_string())))
            .build()
            .expect("valid config");
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
