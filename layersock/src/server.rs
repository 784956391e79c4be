//! Listening servers
//!
//! A [`Server`] binds one listener on worker 0 and spreads accepted
//! connections across its workers. With TLS enabled, every accepted
//! connection handshakes against the context published at accept time.

use crate::env::Env;
use crate::error::{Error, Result};
use crate::service::{Service, ServiceHandle};
use crate::socket::{AcceptTls, Handler, HandlerFactory};
use layersock_core::event::SocketId;
use layersock_core::options::ServiceOptions;
use layersock_core::tcp;
use layersock_core::Error as CoreError;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Server options.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Worker pool options
    pub service: ServiceOptions,

    /// Handshake TLS on every accepted connection
    pub tls: bool,

    /// Refuse clients that present no certificate (only with `tls`)
    pub require_client_cert: bool,
}

impl ServerOptions {
    /// Plain TCP with default worker options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker pool options.
    pub fn with_service(mut self, service: ServiceOptions) -> Self {
        self.service = service;
        self
    }

    /// Enable TLS on accepted connections.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Require client certificates. Implies TLS.
    pub fn with_required_client_cert(mut self, require: bool) -> Self {
        self.require_client_cert = require;
        if require {
            self.tls = true;
        }
        self
    }
}

/// TCP (or TLS) server.
#[derive(Debug)]
pub struct Server {
    service: Service,
    options: ServerOptions,
    listener: Option<(SocketId, SocketAddr)>,
}

impl Server {
    /// Start the server's workers. Nothing listens until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Fails if the worker pool cannot be started.
    pub fn new(env: &Env, options: ServerOptions) -> Result<Self> {
        let service = Service::start(options.service.clone(), env.tls().clone())?;
        Ok(Self {
            service,
            options,
            listener: None,
        })
    }

    /// Listen on `addr:port`; each accepted connection gets a handler from
    /// `factory`. Port 0 picks a free port; the bound address is returned.
    ///
    /// # Errors
    ///
    /// [`Error::TlsNotConfigured`] if TLS is enabled but no context is
    /// published, `AlreadyStarted` if this server already listens, or the
    /// resolve/bind failure.
    pub fn start<F, H>(&mut self, addr: &str, port: u16, factory: F) -> Result<SocketAddr>
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler,
    {
        if self.listener.is_some() {
            return Err(CoreError::AlreadyStarted.into());
        }
        let tls = if self.options.tls {
            if !self.service.tls().is_configured() {
                return Err(Error::TlsNotConfigured);
            }
            Some(AcceptTls {
                require_client_cert: self.options.require_client_cert,
            })
        } else {
            None
        };
        let factory: HandlerFactory = Arc::new(move || Box::new(factory()) as Box<dyn Handler>);
        let bind = tcp::resolve(addr, port)?;
        let (id, local) = self.service.listen(bind, factory, tls)?;
        info!(
            "[server] listening on {} ({})",
            local,
            if self.options.tls { "TLS" } else { "plain" }
        );
        self.listener = Some((id, local));
        Ok(local)
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.map(|(_, addr)| addr)
    }

    /// Handle for addressing the server's sockets.
    pub fn handle(&self) -> ServiceHandle {
        self.service.handle()
    }

    /// Open sockets across all workers, the listener included.
    pub fn socket_count(&self) -> usize {
        self.service.socket_count()
    }

    /// Stop listening, close every connection and stop the workers.
    /// Calling it again does nothing.
    pub fn stop(&mut self) {
        if let Some((id, addr)) = self.listener.take() {
            // the worker closes its sockets on stop anyway
            let _ = self.service.close(id);
            info!("[server] stopping listener on {}", addr);
        }
        self.service.stop();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
