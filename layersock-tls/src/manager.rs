//! Process-wide TLS context publication
//!
//! Readers always observe either the previous or the new complete context.
//! `configure` builds off to the side and publishes only on success, so a
//! failed reconfiguration leaves running and future sessions on the old one.

use crate::config::TlsContextConfig;
use crate::context::TlsContext;
use crate::error::ConfigError;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Holder of the published default context.
#[derive(Default)]
pub struct TlsManager {
    // the lock only guards the pointer swap, never a build
    current: RwLock<Option<Arc<TlsContext>>>,
}

impl TlsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from `config` and publish it.
    ///
    /// # Errors
    ///
    /// Returns the build failure; the published context is unchanged.
    pub fn configure(&self, config: &TlsContextConfig) -> Result<Arc<TlsContext>, ConfigError> {
        let ctx = match TlsContext::server(config) {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                warn!("[TLS] Configuration rejected: {}", e);
                return Err(e);
            }
        };
        let previous = self.current.write().replace(ctx.clone());
        match previous {
            Some(old) => info!("[TLS] Context #{} replaces #{}", ctx.id(), old.id()),
            None => info!("[TLS] Context #{} published", ctx.id()),
        }
        Ok(ctx)
    }

    /// The published context, if any.
    pub fn current(&self) -> Option<Arc<TlsContext>> {
        self.current.read().clone()
    }

    pub fn is_configured(&self) -> bool {
        self.current.read().is_some()
    }

    /// Withdraw the published context. Sessions holding it keep working
    /// until they drop.
    pub fn clear(&self) -> Option<Arc<TlsContext>> {
        let old = self.current.write().take();
        if let Some(ctx) = &old {
            debug!("[TLS] Context #{} withdrawn", ctx.id());
        }
        old
    }
}

impl std::fmt::Debug for TlsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsManager")
            .field("current", &self.current.read().as_ref().map(|c| c.id()))
            .finish()
    }
}

/// Install the ring provider as the process default. Calling it again is
/// harmless.
pub fn install_crypto_provider() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("[TLS] Crypto provider already installed");
    }
}
