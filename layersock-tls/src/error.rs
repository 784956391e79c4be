//! TLS overlay error types
//!
//! `ConfigError` covers building a context from files on disk and is always
//! reported synchronously to whoever called `configure`. `Error` covers a
//! live session; any variant other than `NotEstablished` means the session is
//! finished and the socket should be closed.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to build a TLS context.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Certificate file is required")]
    MissingCertificate,

    #[error("Private key file is required")]
    MissingPrivateKey,

    #[error("A CA certificate file or directory is required")]
    MissingTrustAnchor,

    /// Client certificate and key must be supplied together
    #[error("Certificate and private key must be given together")]
    IncompleteKeyPair,

    #[error("Invalid protocol token: {0:?}")]
    InvalidProtocol(String),

    #[error("No supported protocol version enabled")]
    NoSupportedProtocol,

    #[error("Failed to load certificate {path:?}: {reason}")]
    Certificate { path: PathBuf, reason: String },

    #[error("Failed to load private key {path:?}: {reason}")]
    PrivateKey { path: PathBuf, reason: String },

    #[error("Failed to load trust anchors: {0}")]
    TrustAnchor(String),

    #[error("Failed to load DH parameters {path:?}: {reason}")]
    DhParams { path: PathBuf, reason: String },

    /// Cipher list matched nothing the crypto provider offers
    #[error("No usable cipher in {0:?}")]
    Ciphers(String),

    #[error("Peer verifier error: {0}")]
    Verifier(String),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

impl ConfigError {
    pub(crate) fn certificate(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Certificate {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn private_key(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::PrivateKey {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn dh_params(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::DhParams {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failure of a TLS session.
#[derive(Error, Debug)]
pub enum Error {
    /// Protocol violation, certificate rejection or a fatal alert
    #[error("TLS connection error: {0}")]
    Connection(#[from] rustls::Error),

    /// Transport failure under the session
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Peer went away before the handshake finished
    #[error("Connection reset during handshake")]
    Reset,

    /// Application data before the handshake finished
    #[error("TLS session is not established")]
    NotEstablished,

    /// Session already failed or shut down
    #[error("TLS session is closed")]
    Closed,

    /// Context has no server certificate to accept with
    #[error("TLS context cannot accept connections")]
    NoServerIdentity,

    #[error("Invalid server name: {0:?}")]
    InvalidServerName(String),
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the peer connection is unusable and must be reset.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Io(_) | Self::Reset | Self::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors() {
        assert!(Error::Reset.is_connection_error());
        assert!(Error::Connection(rustls::Error::DecryptError).is_connection_error());
        assert!(!Error::NotEstablished.is_connection_error());
        assert!(!Error::InvalidServerName("a b".into()).is_connection_error());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::certificate("/tmp/missing.pem", "not found");
        let msg = err.to_string();
        assert!(msg.contains("missing.pem"));
        assert!(msg.contains("not found"));
    }
}
