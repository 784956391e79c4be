//! TLS contexts
//!
//! A [`TlsContext`] is immutable once built. It carries two server
//! configurations (client certificate required or merely verified when
//! presented) and one client configuration. Anything that fails while
//! building drops the partial state on the way out; there is no
//! half-configured context.

use crate::config::{ClientTlsConfig, Protocols, TlsContextConfig};
use crate::error::ConfigError;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedCipherSuite};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// OpenSSL spellings of the suites the ring provider implements, paired
/// with their IANA names.
const SUITE_ALIASES: &[(&str, &str)] = &[
    ("TLS_AES_128_GCM_SHA256", "TLS13_AES_128_GCM_SHA256"),
    ("TLS_AES_256_GCM_SHA384", "TLS13_AES_256_GCM_SHA384"),
    ("TLS_CHACHA20_POLY1305_SHA256", "TLS13_CHACHA20_POLY1305_SHA256"),
    (
        "ECDHE-ECDSA-AES128-GCM-SHA256",
        "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    ),
    (
        "ECDHE-ECDSA-AES256-GCM-SHA384",
        "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    ),
    (
        "ECDHE-ECDSA-CHACHA20-POLY1305",
        "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    ),
    (
        "ECDHE-RSA-AES128-GCM-SHA256",
        "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    ),
    (
        "ECDHE-RSA-AES256-GCM-SHA384",
        "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    ),
    (
        "ECDHE-RSA-CHACHA20-POLY1305",
        "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
    ),
];

/// Keywords that select every suite of the list's protocol version.
const SUITE_KEYWORDS: &[&str] = &["ALL", "DEFAULT", "HIGH"];

/// Summary of what a context negotiates.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    pub protocols: Protocols,
    pub cipher_suites: Vec<String>,
    pub prefer_server_ciphers: bool,
    pub trust_anchors: usize,
}

/// Immutable TLS context shared by every session created against it.
pub struct TlsContext {
    id: u64,
    server_strict: Option<Arc<ServerConfig>>,
    server_lenient: Option<Arc<ServerConfig>>,
    client: Arc<ClientConfig>,
    policy: TlsPolicy,
}

impl TlsContext {
    /// Build a full context able to accept and connect.
    ///
    /// # Errors
    ///
    /// Returns the first validation or load failure; nothing is kept.
    pub fn server(config: &TlsContextConfig) -> Result<Self, ConfigError> {
        let protocols = config.validate()?;
        let versions = protocols.versions()?;
        let provider = Arc::new(select_provider(
            config.ciphers.as_deref(),
            config.ciphersuites.as_deref(),
        )?);

        let chain = load_certs(&config.cert_file)?;
        let key = load_private_key(&config.key_file)?;
        let roots = Arc::new(load_roots(
            config.ca_cert_file.as_deref(),
            config.ca_cert_dir.as_deref(),
        )?);
        if let Some(path) = &config.dh_params_file {
            check_dh_params(path)?;
        }

        let strict = WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone())
            .build()
            .map_err(|e| ConfigError::Verifier(e.to_string()))?;
        let lenient = WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone())
            .allow_unauthenticated()
            .build()
            .map_err(|e| ConfigError::Verifier(e.to_string()))?;

        let mut server_configs = Vec::with_capacity(2);
        for verifier in [strict, lenient] {
            let mut server = ServerConfig::builder_with_provider(provider.clone())
                .with_protocol_versions(&versions)?
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain.clone(), key.clone_key())?;
            server.ignore_client_order = config.prefer_server_ciphers;
            server_configs.push(Arc::new(server));
        }
        let server_lenient = server_configs.pop();
        let server_strict = server_configs.pop();

        let client = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&versions)?
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(chain, key)?;

        let ctx = Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            server_strict,
            server_lenient,
            client: Arc::new(client),
            policy: TlsPolicy {
                protocols: protocols.supported(),
                cipher_suites: suite_names(&provider),
                prefer_server_ciphers: config.prefer_server_ciphers,
                trust_anchors: roots.len(),
            },
        };
        info!(
            "[TLS] Built context #{} ({:?}, {} trust anchors)",
            ctx.id, ctx.policy.protocols, ctx.policy.trust_anchors
        );
        Ok(ctx)
    }

    /// Build a connect-only context for one client socket.
    ///
    /// # Errors
    ///
    /// Returns the first validation or load failure.
    pub fn client(config: &ClientTlsConfig) -> Result<Self, ConfigError> {
        let protocols = config.validate()?;
        let versions = protocols.versions()?;
        let provider = Arc::new(ring::default_provider());
        let roots = load_roots(Some(&config.ca_file), None)?;
        let trust_anchors = roots.len();

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&versions)?
            .with_root_certificates(roots);
        let client = match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => {
                builder.with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?
            }
            _ => builder.with_no_client_auth(),
        };

        debug!("[TLS] Built private client context");
        Ok(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            server_strict: None,
            server_lenient: None,
            client: Arc::new(client),
            policy: TlsPolicy {
                protocols: protocols.supported(),
                cipher_suites: suite_names(&provider),
                prefer_server_ciphers: false,
                trust_anchors,
            },
        })
    }

    /// Process-unique identifier, increasing with each build.
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn policy(&self) -> &TlsPolicy {
        &self.policy
    }

    /// Server configuration, `None` for connect-only contexts.
    pub fn server_config(&self, require_client_cert: bool) -> Option<Arc<ServerConfig>> {
        if require_client_cert {
            self.server_strict.clone()
        } else {
            self.server_lenient.clone()
        }
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client.clone()
    }

    pub const fn can_accept(&self) -> bool {
        self.server_strict.is_some()
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("id", &self.id)
            .field("can_accept", &self.can_accept())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn suite_names(provider: &CryptoProvider) -> Vec<String> {
    provider
        .cipher_suites
        .iter()
        .map(|s| format!("{:?}", s.suite()))
        .collect()
}

/// Ring provider restricted to the named TLSv1.2 and TLSv1.3 suites.
fn select_provider(
    ciphers: Option<&str>,
    ciphersuites: Option<&str>,
) -> Result<CryptoProvider, ConfigError> {
    let mut provider = ring::default_provider();
    if let Some(list) = ciphers {
        provider.cipher_suites = filter_suites(provider.cipher_suites, list, false)?;
    }
    if let Some(list) = ciphersuites {
        provider.cipher_suites = filter_suites(provider.cipher_suites, list, true)?;
    }
    Ok(provider)
}

/// Keep suites of the other protocol version untouched and narrow this
/// version's suites to the ones named in `list`, in list order.
fn filter_suites(
    suites: Vec<SupportedCipherSuite>,
    list: &str,
    tls13: bool,
) -> Result<Vec<SupportedCipherSuite>, ConfigError> {
    let (mine, others): (Vec<_>, Vec<_>) = suites
        .into_iter()
        .partition(|s| matches!(s, SupportedCipherSuite::Tls13(_)) == tls13);

    let mut picked: Vec<SupportedCipherSuite> = Vec::new();
    for entry in list.split([':', ',', ' ']).map(str::trim) {
        if entry.is_empty() || entry.starts_with(['!', '-', '+']) {
            continue;
        }
        if SUITE_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(entry)) {
            for suite in &mine {
                if !picked.contains(suite) {
                    picked.push(*suite);
                }
            }
            continue;
        }
        let iana = SUITE_ALIASES
            .iter()
            .find(|(openssl, iana)| {
                openssl.eq_ignore_ascii_case(entry) || iana.eq_ignore_ascii_case(entry)
            })
            .map(|(_, iana)| *iana);
        let found = iana.and_then(|name| {
            mine.iter()
                .find(|s| format!("{:?}", s.suite()) == name)
                .copied()
        });
        match found {
            Some(suite) if !picked.contains(&suite) => picked.push(suite),
            Some(_) => {}
            None => debug!("[TLS] Ignoring unknown cipher {:?}", entry),
        }
    }

    if picked.is_empty() {
        return Err(ConfigError::Ciphers(list.to_string()));
    }
    picked.extend(others);
    Ok(picked)
}

/// Read every certificate in a PEM file.
pub(crate) fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|e| ConfigError::certificate(path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::certificate(path, e))?;
    if certs.is_empty() {
        return Err(ConfigError::certificate(path, "no certificates found"));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file.
pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|e| ConfigError::private_key(path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ConfigError::private_key(path, e))?
        .ok_or_else(|| ConfigError::private_key(path, "no private key found"))
}

/// Trust anchors from a CA file, a directory of PEM files, or both.
/// Unreadable files in the directory are skipped.
pub(crate) fn load_roots(
    file: Option<&Path>,
    dir: Option<&Path>,
) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();
    if let Some(path) = file {
        let certs = load_certs(path).map_err(|e| ConfigError::TrustAnchor(e.to_string()))?;
        let (added, ignored) = roots.add_parsable_certificates(certs);
        if ignored > 0 {
            warn!("[TLS] Ignored {} unparsable CA certificates in {:?}", ignored, path);
        }
        if added == 0 {
            return Err(ConfigError::TrustAnchor(format!(
                "no usable CA certificate in {}",
                path.display()
            )));
        }
    }
    if let Some(dir) = dir {
        let entries = fs::read_dir(dir)
            .map_err(|e| ConfigError::TrustAnchor(format!("{}: {e}", dir.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match load_certs(&path) {
                Ok(certs) => {
                    roots.add_parsable_certificates(certs);
                }
                Err(e) => debug!("[TLS] Skipping {:?}: {}", path, e),
            }
        }
    }
    if roots.is_empty() {
        return Err(ConfigError::TrustAnchor("no trust anchors loaded".into()));
    }
    Ok(roots)
}

/// DH parameters only need to be present and well formed; key exchange is
/// done with the provider's ECDHE groups.
pub(crate) fn check_dh_params(path: &Path) -> Result<(), ConfigError> {
    let pem = fs::read_to_string(path).map_err(|e| ConfigError::dh_params(path, e))?;
    let found = ["-----BEGIN DH PARAMETERS-----", "-----BEGIN X9.42 DH PARAMETERS-----"]
        .iter()
        .any(|tag| pem.contains(tag));
    if !found {
        return Err(ConfigError::dh_params(path, "no DH PARAMETERS block"));
    }
    debug!("[TLS] DH parameters present in {:?}, using ECDHE groups", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_suites() -> Vec<SupportedCipherSuite> {
        ring::default_provider().cipher_suites
    }

    fn names(suites: &[SupportedCipherSuite]) -> Vec<String> {
        suites.iter().map(|s| format!("{:?}", s.suite())).collect()
    }

    #[test]
    fn test_filter_by_openssl_name() {
        let picked = filter_suites(
            ring_suites(),
            "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256",
            false,
        )
        .unwrap();
        let names = names(&picked);
        let tls12: Vec<_> = names.iter().filter(|n| !n.starts_with("TLS13")).collect();
        assert_eq!(
            tls12,
            [
                "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
                "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256"
            ]
        );
        // TLSv1.3 suites untouched
        assert_eq!(names.iter().filter(|n| n.starts_with("TLS13")).count(), 3);
    }

    #[test]
    fn test_filter_tls13_by_iana_name() {
        let picked = filter_suites(ring_suites(), "TLS13_AES_128_GCM_SHA256", true).unwrap();
        let names = names(&picked);
        assert_eq!(names[0], "TLS13_AES_128_GCM_SHA256");
        assert_eq!(names.iter().filter(|n| n.starts_with("TLS13")).count(), 1);
    }

    #[test]
    fn test_filter_keywords_and_exclusions() {
        let all = ring_suites().len();
        let picked = filter_suites(ring_suites(), "HIGH:!aNULL:!MD5", false).unwrap();
        assert_eq!(picked.len(), all);
    }

    #[test]
    fn test_filter_nothing_matches() {
        let err = filter_suites(ring_suites(), "RC4-MD5:NULL-SHA", false).unwrap_err();
        assert!(matches!(err, ConfigError::Ciphers(_)));
    }
}
