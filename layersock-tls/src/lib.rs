//! Layersock TLS
//!
//! TLS overlay for non-blocking sockets, built on `rustls`:
//! - `config`: context configuration and protocol list parsing
//! - `context`: immutable server/client contexts built from PEM files
//! - `manager`: atomically published process-wide default context
//! - `session`: per-socket handshake, send and receive state machine
//!
//! Sessions never block. Each call reports either progress or the one
//! direction ([`Interest::READ`] or [`Interest::WRITE`]) the caller should
//! wait for before calling again.
//!
//! [`Interest::READ`]: layersock_core::interest::Interest::READ
//! [`Interest::WRITE`]: layersock_core::interest::Interest::WRITE

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod session;

pub use config::{ClientTlsConfig, Protocols, TlsContextConfig};
pub use context::{TlsContext, TlsPolicy};
pub use error::{ConfigError, Error, Result};
pub use manager::{install_crypto_provider, TlsManager};
pub use session::{Handshake, Mode, SessionState, TlsIo, TlsSession};
