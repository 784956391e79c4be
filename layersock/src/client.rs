//! Outgoing connections
//!
//! A [`Client`] owns a worker pool of its own. Each [`connect`](Client::connect)
//! creates a Connector socket on one of its workers; the handler sees
//! `on_handshake_complete` (with TLS) and `on_connect` once the socket is
//! usable, or `on_close(CloseReason::ConnectFailed)` if the connect fails.

use crate::env::Env;
use crate::error::Result;
use crate::service::{Connecting, Service, ServiceHandle};
use crate::socket::Handler;
use layersock_core::options::ServiceOptions;
use layersock_tls::ClientTlsConfig;

/// Per-connection options.
///
/// # Examples
///
/// ```
/// use layersock::ConnectOptions;
///
/// let opts = ConnectOptions::tls().with_server_name("example.com");
/// assert!(opts.tls);
/// assert_eq!(opts.server_name.as_deref(), Some("example.com"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Run a TLS handshake once the transport connects
    pub tls: bool,

    /// Name to verify the server certificate against (default: the host)
    pub server_name: Option<String>,

    /// Private client context; leaves the published default untouched
    pub private_tls: Option<ClientTlsConfig>,
}

impl ConnectOptions {
    /// Plain TCP.
    pub fn plain() -> Self {
        Self::default()
    }

    /// TLS against the published context.
    pub fn tls() -> Self {
        Self {
            tls: true,
            ..Self::default()
        }
    }

    /// Verify the server certificate against `name`.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Use a private client context built from `config`. Implies TLS.
    pub fn with_private_tls(mut self, config: ClientTlsConfig) -> Self {
        self.tls = true;
        self.private_tls = Some(config);
        self
    }
}

/// Connection initiator with its own worker pool.
#[derive(Debug)]
pub struct Client {
    service: Service,
}

impl Client {
    /// Start the client's workers.
    ///
    /// # Errors
    ///
    /// Fails if the worker pool cannot be started.
    pub fn new(env: &Env, options: ServiceOptions) -> Result<Self> {
        let service = Service::start(options, env.tls().clone())?;
        Ok(Self { service })
    }

    /// Open a connection to `host:port` driven by `handler`.
    ///
    /// Returns once the socket is handed to a worker; use
    /// [`Connecting::wait`] for its [`SocketId`](crate::SocketId).
    ///
    /// # Errors
    ///
    /// [`Error::TlsNotConfigured`](crate::Error::TlsNotConfigured) if TLS is
    /// requested with neither a private nor a published context, a TLS
    /// configuration error for a bad private context, or an I/O error if
    /// the host does not resolve or the connect fails immediately.
    pub fn connect<H: Handler>(
        &self,
        host: &str,
        port: u16,
        options: &ConnectOptions,
        handler: H,
    ) -> Result<Connecting> {
        self.service.connect(host, port, options, handler)
    }

    /// Handle for addressing the client's sockets.
    pub fn handle(&self) -> ServiceHandle {
        self.service.handle()
    }

    /// Open connections across all workers.
    pub fn socket_count(&self) -> usize {
        self.service.socket_count()
    }

    /// Close every connection and stop the workers.
    pub fn stop(&self) {
        self.service.stop();
    }
}
