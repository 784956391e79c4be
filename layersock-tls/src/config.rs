//! TLS context configuration
//!
//! Plain option structs with chained builders. Nothing here touches the
//! filesystem; files are read when a context is built.

use crate::error::ConfigError;
use rustls::SupportedProtocolVersion;
use std::fmt;
use std::path::PathBuf;
use tracing::warn;

/// Set of TLS protocol versions named in a configuration.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Protocols(u8);

impl Protocols {
    pub const NONE: Self = Self(0);
    pub const TLSV1: Self = Self(0b0001);
    pub const TLSV1_1: Self = Self(0b0010);
    pub const TLSV1_2: Self = Self(0b0100);
    pub const TLSV1_3: Self = Self(0b1000);

    /// Versions enabled when no protocol list is given
    pub const DEFAULT: Self = Self(Self::TLSV1_2.0 | Self::TLSV1_3.0);

    /// Versions that can actually be negotiated
    pub const SUPPORTED: Self = Self::DEFAULT;

    /// Parse a space-separated, case-insensitive list such as
    /// `"TLSv1.2 TLSv1.3"`. An empty list selects [`Protocols::DEFAULT`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidProtocol` for the first unrecognized token.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let mut set = Self::NONE;
        for token in list.split_whitespace() {
            set = set
                | match token.to_ascii_lowercase().as_str() {
                    "tlsv1" => Self::TLSV1,
                    "tlsv1.1" => Self::TLSV1_1,
                    "tlsv1.2" => Self::TLSV1_2,
                    "tlsv1.3" => Self::TLSV1_3,
                    _ => return Err(ConfigError::InvalidProtocol(token.to_string())),
                };
        }
        if set.is_empty() {
            return Ok(Self::DEFAULT);
        }
        Ok(set)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The subset of versions the TLS engine implements.
    #[must_use]
    pub const fn supported(self) -> Self {
        Self(self.0 & Self::SUPPORTED.0)
    }

    /// rustls protocol versions for this set.
    ///
    /// TLSv1 and TLSv1.1 are recognized but not implemented by the engine;
    /// they are dropped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `NoSupportedProtocol` if nothing negotiable remains.
    pub fn versions(self) -> Result<Vec<&'static SupportedProtocolVersion>, ConfigError> {
        if self.contains(Self::TLSV1) || self.contains(Self::TLSV1_1) {
            warn!("[TLS] TLSv1 and TLSv1.1 are not supported, ignoring");
        }
        let mut versions = Vec::with_capacity(2);
        if self.contains(Self::TLSV1_3) {
            versions.push(&rustls::version::TLS13);
        }
        if self.contains(Self::TLSV1_2) {
            versions.push(&rustls::version::TLS12);
        }
        if versions.is_empty() {
            return Err(ConfigError::NoSupportedProtocol);
        }
        Ok(versions)
    }
}

impl Default for Protocols {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::ops::BitOr for Protocols {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Protocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::TLSV1, "TLSv1"),
            (Self::TLSV1_1, "TLSv1.1"),
            (Self::TLSV1_2, "TLSv1.2"),
            (Self::TLSV1_3, "TLSv1.3"),
        ];
        let mut list = f.debug_set();
        for (flag, name) in names {
            if self.contains(flag) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}

/// Configuration for the process-wide TLS context.
///
/// Certificate, private key and at least one of `ca_cert_file` /
/// `ca_cert_dir` are required. `ciphers` applies to TLSv1.2 and
/// `ciphersuites` to TLSv1.3; both are colon-separated lists that accept
/// either OpenSSL or IANA suite names.
///
/// # Examples
///
/// ```
/// use layersock_tls::TlsContextConfig;
///
/// let config = TlsContextConfig::new("server.pem", "server.key")
///     .with_ca_file("ca.pem")
///     .with_protocols("TLSv1.2 TLSv1.3")
///     .with_prefer_server_ciphers(true);
/// assert!(config.prefer_server_ciphers);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TlsContextConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub dh_params_file: Option<PathBuf>,
    pub ca_cert_file: Option<PathBuf>,
    pub ca_cert_dir: Option<PathBuf>,
    /// Space-separated protocol list (empty = TLSv1.2 + TLSv1.3)
    pub protocols: String,
    pub ciphers: Option<String>,
    pub ciphersuites: Option<String>,
    /// Server picks the cipher by its own preference order
    pub prefer_server_ciphers: bool,
}

impl TlsContextConfig {
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ..Self::default()
        }
    }

    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_file = Some(path.into());
        self
    }

    pub fn with_ca_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_dir = Some(path.into());
        self
    }

    pub fn with_dh_params(mut self, path: impl Into<PathBuf>) -> Self {
        self.dh_params_file = Some(path.into());
        self
    }

    pub fn with_protocols(mut self, protocols: impl Into<String>) -> Self {
        self.protocols = protocols.into();
        self
    }

    pub fn with_ciphers(mut self, ciphers: impl Into<String>) -> Self {
        self.ciphers = Some(ciphers.into());
        self
    }

    pub fn with_ciphersuites(mut self, suites: impl Into<String>) -> Self {
        self.ciphersuites = Some(suites.into());
        self
    }

    pub fn with_prefer_server_ciphers(mut self, prefer: bool) -> Self {
        self.prefer_server_ciphers = prefer;
        self
    }

    /// Check required fields and parse the protocol list.
    ///
    /// # Errors
    ///
    /// Returns the first missing field or invalid protocol token.
    pub fn validate(&self) -> Result<Protocols, ConfigError> {
        if self.cert_file.as_os_str().is_empty() {
            return Err(ConfigError::MissingCertificate);
        }
        if self.key_file.as_os_str().is_empty() {
            return Err(ConfigError::MissingPrivateKey);
        }
        if self.ca_cert_file.is_none() && self.ca_cert_dir.is_none() {
            return Err(ConfigError::MissingTrustAnchor);
        }
        Protocols::parse(&self.protocols)
    }
}

/// Private client context for one connecting socket.
///
/// The CA file is required; a client certificate is optional but must come
/// with its key.
#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    pub ca_file: PathBuf,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub protocols: String,
}

impl ClientTlsConfig {
    pub fn new(ca_file: impl Into<PathBuf>) -> Self {
        Self {
            ca_file: ca_file.into(),
            ..Self::default()
        }
    }

    pub fn with_client_cert(
        mut self,
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
    ) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    pub fn with_protocols(mut self, protocols: impl Into<String>) -> Self {
        self.protocols = protocols.into();
        self
    }

    /// # Errors
    ///
    /// Returns an error if the CA file is missing, only one half of the
    /// key pair is given, or the protocol list is invalid.
    pub fn validate(&self) -> Result<Protocols, ConfigError> {
        if self.ca_file.as_os_str().is_empty() {
            return Err(ConfigError::MissingTrustAnchor);
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(ConfigError::IncompleteKeyPair);
        }
        Protocols::parse(&self.protocols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_protocols() {
        let p = Protocols::parse("TLSv1.2 tlsv1.3").unwrap();
        assert!(p.contains(Protocols::TLSV1_2));
        assert!(p.contains(Protocols::TLSV1_3));
        assert!(!p.contains(Protocols::TLSV1));
        assert_eq!(format!("{p:?}"), "{TLSv1.2, TLSv1.3}");
    }

    #[test]
    fn test_parse_empty_is_default() {
        assert_eq!(Protocols::parse("  ").unwrap(), Protocols::DEFAULT);
    }

    #[test]
    fn test_parse_rejects_unknown_token() {
        let err = Protocols::parse("tlsv1.2 sslv3").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProtocol(t) if t == "sslv3"));
        assert!(Protocols::parse("tlsv1.2x").is_err());
    }

    #[test]
    fn test_legacy_only_has_no_versions() {
        let p = Protocols::parse("TLSv1 TLSv1.1").unwrap();
        assert!(p.supported().is_empty());
        assert!(matches!(
            p.versions(),
            Err(ConfigError::NoSupportedProtocol)
        ));
    }

    #[test]
    fn test_legacy_mixed_keeps_supported() {
        let versions = Protocols::parse("tlsv1 tlsv1.2").unwrap().versions().unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, rustls::ProtocolVersion::TLSv1_2);
    }

    #[test]
    fn test_validate_required_fields() {
        assert!(matches!(
            TlsContextConfig::default().validate(),
            Err(ConfigError::MissingCertificate)
        ));
        assert!(matches!(
            TlsContextConfig::new("c.pem", "").validate(),
            Err(ConfigError::MissingPrivateKey)
        ));
        assert!(matches!(
            TlsContextConfig::new("c.pem", "k.pem").validate(),
            Err(ConfigError::MissingTrustAnchor)
        ));
        assert!(TlsContextConfig::new("c.pem", "k.pem")
            .with_ca_dir("/etc/ssl/certs")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_client_key_pair_together() {
        let mut cfg = ClientTlsConfig::new("ca.pem");
        assert!(cfg.validate().is_ok());
        cfg.cert_file = Some("client.pem".into());
        assert!(matches!(cfg.validate(), Err(ConfigError::IncompleteKeyPair)));
        assert!(ClientTlsConfig::new("")
            .validate()
            .is_err());
    }
}
