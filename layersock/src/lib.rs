//! # Layersock
//!
//! Event-driven sockets assembled from independent layers: a non-blocking
//! transport, an optional TLS overlay and an application [`Handler`].
//!
//! ## Architecture
//!
//! - **`layersock-core`**: readiness backends (poll, edge-triggered,
//!   one-shot completion), socket sets, delayed event queues, wakers
//! - **`layersock-tls`**: `rustls` contexts, published-context manager and a
//!   non-blocking session state machine
//! - **`layersock`**: worker pool, socket roles, servers and clients (this
//!   crate)
//!
//! Every socket belongs to exactly one worker thread for its whole life.
//! Other threads reach it through a [`ServiceHandle`]: posted events, sends
//! and closes are messages to the owning worker.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use layersock::prelude::*;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_receive(&mut self, ctx: &mut SocketContext<'_>, data: &[u8]) {
//!         ctx.send(data);
//!     }
//! }
//!
//! # fn main() -> layersock::Result<()> {
//! let env = layersock::init();
//! env.configure_tls(
//!     &TlsContextConfig::new("server.pem", "server.key").with_ca_file("ca.pem"),
//! )?;
//!
//! let mut server = Server::new(&env, ServerOptions::new().with_tls(true))?;
//! let addr = server.start("127.0.0.1", 7000, || Echo)?;
//! println!("listening on {addr}");
//! # server.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Notification order
//!
//! For each socket: `on_handshake_complete` (TLS only), `on_connect`, then
//! any number of `on_receive`, `on_send`, `on_event` and `on_idle`, and
//! finally exactly one `on_close`.

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod client;
mod dev_tracing;
mod env;
mod error;
mod server;
mod service;
mod socket;
mod worker;

pub use client::{Client, ConnectOptions};
pub use dev_tracing::init_tracing;
pub use env::{init, Env};
pub use error::{Error, Result};
pub use server::{Server, ServerOptions};
pub use service::{Connecting, Service, ServiceHandle, DEFAULT_REPLY_TIMEOUT};
pub use socket::{CloseReason, Handler, HandlerFactory, Role, SocketContext};

pub use bytes::Bytes;
pub use layersock_core::backend::BackendKind;
pub use layersock_core::event::{Event, SocketId};
pub use layersock_core::options::{Assignment, ServiceOptions};
pub use layersock_tls::{
    ClientTlsConfig, ConfigError, Protocols, SessionState, TlsContext, TlsContextConfig,
    TlsManager, TlsPolicy, TlsSession,
};

/// Everything needed to write a handler and run a server or client.
pub mod prelude {
    pub use crate::{
        init, Assignment, BackendKind, Bytes, Client, ClientTlsConfig, CloseReason,
        ConnectOptions, Env, Event, Handler, Role, Server, ServerOptions, ServiceHandle,
        ServiceOptions, SocketContext, SocketId, TlsContextConfig,
    };
}
