//! Process-wide state
//!
//! [`init`] prepares the TLS provider and returns the [`Env`] that owns the
//! published TLS context. Servers and clients are created from an `Env`, so
//! its lifetime is explicit instead of hidden in a global.

use layersock_tls::{install_crypto_provider, ConfigError, TlsContext, TlsContextConfig, TlsManager};
use std::sync::Arc;
use tracing::info;

/// Initialize the library.
///
/// Installs the process-wide rustls crypto provider (a no-op if one is
/// already installed) and returns a handle with no TLS context published.
pub fn init() -> Env {
    install_crypto_provider();
    info!("[env] layersock {} initialized", env!("CARGO_PKG_VERSION"));
    Env {
        tls: Arc::new(TlsManager::new()),
    }
}

/// Owner of the published TLS context.
///
/// Cloning is cheap; clones share the same context.
#[derive(Debug, Clone)]
pub struct Env {
    tls: Arc<TlsManager>,
}

impl Env {
    /// Build a TLS context from `config` and publish it.
    ///
    /// Sockets created afterwards use the new context; established sessions
    /// keep the one they started with.
    ///
    /// # Errors
    ///
    /// Returns the configuration error and leaves the published context
    /// untouched.
    pub fn configure_tls(&self, config: &TlsContextConfig) -> Result<Arc<TlsContext>, ConfigError> {
        self.tls.configure(config)
    }

    /// The context manager shared with every service built from this `Env`.
    pub fn tls(&self) -> &Arc<TlsManager> {
        &self.tls
    }

    /// Release the published TLS context. Sessions still holding it keep
    /// it alive until they close.
    pub fn term(self) {
        if self.tls.clear().is_some() {
            info!("[env] TLS context released");
        }
    }
}
