//! Context building and publication tests against the PEM fixtures.

use layersock_tls::{
    ClientTlsConfig, ConfigError, Protocols, TlsContext, TlsContextConfig, TlsManager,
};
use std::path::PathBuf;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn server_config() -> TlsContextConfig {
    TlsContextConfig::new(fixture("server.pem"), fixture("server.key"))
        .with_ca_file(fixture("ca.pem"))
}

#[test]
fn test_build_full_context() {
    let ctx = TlsContext::server(&server_config()).unwrap();
    assert!(ctx.can_accept());
    assert!(ctx.server_config(true).is_some());
    assert!(ctx.server_config(false).is_some());
    assert_eq!(ctx.policy().protocols, Protocols::DEFAULT);
    assert_eq!(ctx.policy().trust_anchors, 1);
    assert!(!ctx.policy().cipher_suites.is_empty());
}

#[test]
fn test_policy_reflects_config() {
    let config = server_config()
        .with_protocols("TLSv1.3")
        .with_ciphersuites("TLS_AES_256_GCM_SHA384")
        .with_prefer_server_ciphers(true);
    let ctx = TlsContext::server(&config).unwrap();
    let policy = ctx.policy();
    assert_eq!(policy.protocols, Protocols::TLSV1_3);
    assert!(policy.prefer_server_ciphers);
    assert!(policy
        .cipher_suites
        .iter()
        .any(|s| s == "TLS13_AES_256_GCM_SHA384"));
    assert!(!policy
        .cipher_suites
        .iter()
        .any(|s| s == "TLS13_AES_128_GCM_SHA256"));
}

#[test]
fn test_ca_dir_skips_unreadable_entries() {
    // the fixture directory mixes certificates, keys and garbage
    let config = TlsContextConfig::new(fixture("server.pem"), fixture("server.key"))
        .with_ca_dir(fixture(""));
    let ctx = TlsContext::server(&config).unwrap();
    assert!(ctx.policy().trust_anchors >= 1);

    let config = TlsContextConfig::new(fixture("server.pem"), fixture("server.key"))
        .with_ca_dir(fixture("ca_dir"));
    assert_eq!(TlsContext::server(&config).unwrap().policy().trust_anchors, 1);
}

#[test]
fn test_dh_params() {
    assert!(TlsContext::server(&server_config().with_dh_params(fixture("dhparams.pem"))).is_ok());

    let err = TlsContext::server(&server_config().with_dh_params(fixture("garbage.pem")))
        .unwrap_err();
    assert!(matches!(err, ConfigError::DhParams { .. }), "{err}");

    let err = TlsContext::server(&server_config().with_dh_params(fixture("missing.pem")))
        .unwrap_err();
    assert!(matches!(err, ConfigError::DhParams { .. }), "{err}");
}

#[test]
fn test_load_failures() {
    let err = TlsContext::server(
        &TlsContextConfig::new(fixture("missing.pem"), fixture("server.key"))
            .with_ca_file(fixture("ca.pem")),
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Certificate { .. }), "{err}");

    let err = TlsContext::server(
        &TlsContextConfig::new(fixture("garbage.pem"), fixture("server.key"))
            .with_ca_file(fixture("ca.pem")),
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Certificate { .. }), "{err}");

    let err = TlsContext::server(
        &TlsContextConfig::new(fixture("server.pem"), fixture("server.pem"))
            .with_ca_file(fixture("ca.pem")),
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::PrivateKey { .. }), "{err}");

    let err = TlsContext::server(
        &TlsContextConfig::new(fixture("server.pem"), fixture("server.key"))
            .with_ca_file(fixture("garbage.pem")),
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::TrustAnchor(_)), "{err}");
}

#[test]
fn test_protocol_errors() {
    let err = TlsContext::server(&server_config().with_protocols("TLSv1.2 SSLv3")).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidProtocol(_)), "{err}");

    let err = TlsContext::server(&server_config().with_protocols("TLSv1 TLSv1.1")).unwrap_err();
    assert!(matches!(err, ConfigError::NoSupportedProtocol), "{err}");

    // legacy versions next to a supported one are dropped
    let ctx = TlsContext::server(&server_config().with_protocols("tlsv1 tlsv1.2")).unwrap();
    assert_eq!(ctx.policy().protocols, Protocols::TLSV1_2);
}

#[test]
fn test_unknown_ciphers_rejected() {
    let err = TlsContext::server(&server_config().with_ciphers("RC4-SHA")).unwrap_err();
    assert!(matches!(err, ConfigError::Ciphers(_)), "{err}");
}

#[test]
fn test_client_context() {
    let ctx = TlsContext::client(&ClientTlsConfig::new(fixture("ca.pem"))).unwrap();
    assert!(!ctx.can_accept());
    assert!(ctx.server_config(false).is_none());

    let ctx = TlsContext::client(
        &ClientTlsConfig::new(fixture("ca.pem"))
            .with_client_cert(fixture("client.pem"), fixture("client.key")),
    )
    .unwrap();
    assert_eq!(ctx.policy().trust_anchors, 1);

    let err = TlsContext::client(&ClientTlsConfig::new(fixture("missing.pem"))).unwrap_err();
    assert!(matches!(err, ConfigError::TrustAnchor(_)), "{err}");
}

#[test]
fn test_manager_publishes_and_swaps() {
    let manager = TlsManager::new();
    assert!(!manager.is_configured());
    assert!(manager.current().is_none());

    let first = manager.configure(&server_config()).unwrap();
    let held = manager.current().unwrap();
    assert_eq!(held.id(), first.id());

    let second = manager.configure(&server_config()).unwrap();
    assert!(second.id() > first.id());
    assert_eq!(manager.current().unwrap().id(), second.id());

    // readers holding the old context keep it alive
    assert!(held.can_accept());
}

#[test]
fn test_manager_failed_configure_keeps_previous() {
    let manager = TlsManager::new();
    let good = manager.configure(&server_config()).unwrap();

    let bad = TlsContextConfig::new(fixture("server.pem"), fixture("missing.key"))
        .with_ca_file(fixture("ca.pem"));
    assert!(manager.configure(&bad).is_err());
    assert!(manager.configure(&server_config().with_protocols("bogus")).is_err());

    assert_eq!(manager.current().unwrap().id(), good.id());
}

#[test]
fn test_manager_clear() {
    let manager = TlsManager::new();
    manager.configure(&server_config()).unwrap();
    assert!(manager.clear().is_some());
    assert!(!manager.is_configured());
    assert!(manager.clear().is_none());
}
